//! Interactive console
//!
//! Reads commands from stdin and runs each request as its own task, so a
//! second request while one is in flight reaches the session manager (and
//! its busy guard) instead of queueing behind it.

use crate::domain::models::{AppEvent, MessageSeverity, SessionKind};
use crate::infrastructure::bluetooth::SessionManager;
use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    TakePhoto,
    DeviceInfo,
    ToggleNotifications,
    Help,
    Quit,
}

impl Command {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "" => Some(Self::TakePhoto),
            "i" | "info" => Some(Self::DeviceInfo),
            "n" | "notify" => Some(Self::ToggleNotifications),
            "h" | "?" | "help" => Some(Self::Help),
            "q" | "quit" | "exit" => Some(Self::Quit),
            _ => None,
        }
    }
}

/// Console line for an application event, if it deserves one
pub fn render_event(event: &AppEvent) -> Option<String> {
    match event {
        // Already traced by the session manager
        AppEvent::SessionState(_) => None,
        AppEvent::Notification(notification) => Some(notification.to_string()),
        AppEvent::DeviceInfo(device_info) => Some(device_info.to_string()),
        AppEvent::SessionFinished(outcome) => Some(outcome.to_string()),
        AppEvent::LogMessage(msg) => {
            let tag = match msg.severity {
                MessageSeverity::Info => "info",
                MessageSeverity::Warning => "warn",
                MessageSeverity::Error => "error",
            };
            Some(format!("[{}] {}", tag, msg.message))
        }
    }
}

/// Print events until every sender is gone
pub async fn print_events(mut rx: mpsc::UnboundedReceiver<AppEvent>) {
    while let Some(event) = rx.recv().await {
        if let Some(line) = render_event(&event) {
            println!("{}", line);
        }
    }
    debug!("Event printer stopped");
}

pub struct ConsoleApp {
    manager: Arc<SessionManager>,
    // Bumped to cancel whatever session is running
    cancel_tx: watch::Sender<u64>,
    tasks: Vec<JoinHandle<()>>,
}

impl ConsoleApp {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        let (cancel_tx, _) = watch::channel(0);
        Self {
            manager,
            cancel_tx,
            tasks: Vec::new(),
        }
    }

    fn cancel_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.cancel_tx.subscribe();
        async move {
            // A dropped sender also counts as cancellation
            let _ = rx.changed().await;
        }
    }

    fn cancel_running(&self) {
        self.cancel_tx.send_modify(|generation| *generation += 1);
    }

    fn start(&mut self, kind: SessionKind) {
        self.tasks.retain(|task| !task.is_finished());

        let manager = self.manager.clone();
        let cancel = self.cancel_signal();
        self.tasks.push(tokio::spawn(async move {
            let result = match kind {
                SessionKind::TakePhoto => manager.take_photo_until(cancel).await,
                SessionKind::DeviceInfo => manager.read_device_info_until(cancel).await,
            };
            if let Err(e) = result {
                debug!("{} request ended with: {}", kind, e);
            }
        }));
    }

    fn print_help(&self) {
        let notifications = if self.manager.notifications_enabled() {
            "on"
        } else {
            "off"
        };
        println!("Camera: {}", self.manager.config().address);
        println!("  ENTER  take a photo");
        println!("  i      read device info");
        println!("  n      toggle status notifications (now {})", notifications);
        println!("  q      quit");
        println!("  Ctrl-C cancels a running session, quits when idle");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::TakePhoto => self.start(SessionKind::TakePhoto),
            Command::DeviceInfo => self.start(SessionKind::DeviceInfo),
            Command::ToggleNotifications => {
                let enabled = !self.manager.notifications_enabled();
                self.manager.set_notifications_enabled(enabled);
            }
            Command::Help => self.print_help(),
            // Handled by the read loop
            Command::Quit => {}
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.print_help();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read from stdin")? else {
                        debug!("stdin closed");
                        break;
                    };
                    match Command::parse(&line) {
                        Some(Command::Quit) => break,
                        Some(command) => self.handle(command),
                        None => println!("Unknown command {:?}, try 'h'", line.trim()),
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for Ctrl-C")?;
                    if !self.manager.is_busy() {
                        break;
                    }
                    warn!("Cancelling the running session");
                    self.cancel_running();
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Cancel anything still running and wait for its teardown
    async fn shutdown(&mut self) {
        if self.manager.is_busy() {
            info!("Waiting for the running session to clean up");
        }
        self.cancel_running();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Session task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        NotificationEvent, PeripheralAddress, SessionOutcome, StatusMessage,
    };
    use crate::domain::session_state::SessionState;
    use crate::error::SessionError;
    use crate::infrastructure::bluetooth::fake_transport::FakeTransport;
    use crate::infrastructure::bluetooth::protocol::GattProfile;
    use crate::infrastructure::bluetooth::SessionConfig;
    use chrono::Local;
    use std::time::Duration;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse(""), Some(Command::TakePhoto));
        assert_eq!(Command::parse("  \n"), Some(Command::TakePhoto));
        assert_eq!(Command::parse("i"), Some(Command::DeviceInfo));
        assert_eq!(Command::parse("N"), Some(Command::ToggleNotifications));
        assert_eq!(Command::parse("q\n"), Some(Command::Quit));
        assert_eq!(Command::parse("exit"), Some(Command::Quit));
        assert_eq!(Command::parse("?"), Some(Command::Help));
        assert_eq!(Command::parse("shoot"), None);
    }

    #[test]
    fn test_render_events() {
        assert_eq!(
            render_event(&AppEvent::SessionState(SessionState::Connecting)),
            None
        );

        let notification = AppEvent::Notification(NotificationEvent::received_now(
            GattProfile::default().status,
            vec![0xAA, 0xBB],
        ));
        let line = render_event(&notification).unwrap();
        assert!(line.contains("[NOTIFY]"));
        assert!(line.contains("aabb"));

        let busy = AppEvent::LogMessage(StatusMessage {
            message: "Busy".to_string(),
            severity: MessageSeverity::Warning,
        });
        assert_eq!(render_event(&busy).unwrap(), "[warn] Busy");

        let now = Local::now();
        let outcome = AppEvent::SessionFinished(SessionOutcome {
            kind: SessionKind::TakePhoto,
            started_at: now,
            finished_at: now,
            final_state: SessionState::Aborted,
            result: Err(SessionError::SessionBusy),
        });
        assert!(render_event(&outcome).unwrap().contains("failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_reaches_running_session() {
        let transport = Arc::new(FakeTransport::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = Arc::new(SessionManager::new(
            transport.clone(),
            SessionConfig::new(PeripheralAddress::parse("DC:FE:23:4A:E0:36").unwrap()),
            tx,
        ));
        let mut app = ConsoleApp::new(manager.clone());

        app.handle(Command::TakePhoto);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.is_busy());

        app.shutdown().await;
        assert!(!manager.is_busy());
        assert_eq!(manager.state(), SessionState::Aborted);
        assert_eq!(transport.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_toggle_notifications() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = Arc::new(SessionManager::new(
            Arc::new(FakeTransport::new()),
            SessionConfig::new(PeripheralAddress::parse("DC:FE:23:4A:E0:36").unwrap()),
            tx,
        ));
        let mut app = ConsoleApp::new(manager.clone());

        app.handle(Command::ToggleNotifications);
        assert!(manager.notifications_enabled());
        app.handle(Command::ToggleNotifications);
        assert!(!manager.notifications_enabled());
    }
}
