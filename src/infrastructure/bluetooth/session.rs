//! Session Manager
//!
//! One session = connect, handshake, (notifications), actuate, disconnect.
//! Only one session runs at a time. Whatever happens inside the session body
//! (error, session timeout, caller cancellation) the teardown runs: a press
//! still latched on the camera is released, the subscription is dropped and
//! the link is closed, in that order.

use crate::domain::models::{
    AppEvent, MessageSeverity, PeripheralAddress, SessionKind, SessionOutcome, StatusMessage,
};
use crate::domain::session_state::SessionState;
use crate::domain::settings::Settings;
use crate::error::{ConfigError, SessionError};
use crate::infrastructure::bluetooth::actuation::{
    release_buttons, trigger_shutter, ActuationTiming, ButtonLatch,
};
use crate::infrastructure::bluetooth::device_info::read_device_info;
use crate::infrastructure::bluetooth::handshake::{perform_handshake, HandshakePayload};
use crate::infrastructure::bluetooth::notifications::{
    disable_notifications, enable_notifications, NotificationChannel,
};
use crate::infrastructure::bluetooth::protocol::{CharacteristicId, GattProfile};
use crate::infrastructure::bluetooth::transport::{bounded, BleTransport, Connection, Link};
use chrono::{DateTime, Local};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// The camera needs at least this long to settle focus before a full press
pub const MIN_FOCUS_DELAY: Duration = Duration::from_millis(300);

/// Configuration for session behavior
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub address: PeripheralAddress,
    pub handshake: HandshakePayload,
    pub profile: GattProfile,
    pub actuation: ActuationTiming,
    /// Grace period after subscribing before the first indication is reliable
    pub notification_settle: Duration,
    /// Upper bound for each transport call
    pub call_timeout: Duration,
    /// Upper bound for the whole session body (connect to last release)
    pub session_timeout: Duration,
    /// How long connect may scan for the camera
    pub scan_timeout: Duration,
    pub enable_notifications: bool,
    pub read_device_info: bool,
}

impl SessionConfig {
    pub fn new(address: PeripheralAddress) -> Self {
        Self {
            address,
            handshake: HandshakePayload::default(),
            profile: GattProfile::default(),
            actuation: ActuationTiming::default(),
            notification_settle: Duration::from_millis(500),
            call_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(20),
            scan_timeout: Duration::from_secs(10),
            enable_notifications: false,
            read_device_info: false,
        }
    }
}

impl TryFrom<&Settings> for SessionConfig {
    type Error = ConfigError;

    fn try_from(s: &Settings) -> Result<Self, Self::Error> {
        let mut focus_delay = Duration::from_millis(s.focus_delay_ms);
        if focus_delay < MIN_FOCUS_DELAY {
            warn!(
                "focus_delay_ms {} is below the {} ms minimum, using the minimum",
                s.focus_delay_ms,
                MIN_FOCUS_DELAY.as_millis()
            );
            focus_delay = MIN_FOCUS_DELAY;
        }

        Ok(Self {
            address: PeripheralAddress::parse(&s.camera_address)?,
            handshake: HandshakePayload::new(&s.device_name)?,
            profile: GattProfile {
                pairing: CharacteristicId::parse(
                    "ble_pairing_char_uuid",
                    &s.ble_pairing_char_uuid,
                )?,
                shutter: CharacteristicId::parse(
                    "ble_shutter_char_uuid",
                    &s.ble_shutter_char_uuid,
                )?,
                status: CharacteristicId::parse("ble_status_char_uuid", &s.ble_status_char_uuid)?,
                status_cccd: CharacteristicId::parse(
                    "ble_status_cccd_uuid",
                    &s.ble_status_cccd_uuid,
                )?,
            },
            actuation: ActuationTiming {
                focus_delay,
                release_delay: Duration::from_millis(s.release_delay_ms),
            },
            notification_settle: Duration::from_millis(s.notification_settle_ms),
            call_timeout: Duration::from_millis(s.transport_timeout_ms),
            session_timeout: Duration::from_millis(s.session_timeout_ms),
            scan_timeout: Duration::from_millis(s.scan_timeout_ms),
            enable_notifications: s.enable_notifications,
            read_device_info: s.read_device_info,
        })
    }
}

/// Whatever a session still holds on the camera when it ends
struct Leftovers {
    connection: Connection,
    notifications: Option<NotificationChannel>,
    latch: ButtonLatch,
}

/// Release, unsubscribe, disconnect. Failures are logged and swallowed so
/// that every step gets its chance.
async fn tear_down(
    transport: &dyn BleTransport,
    profile: &GattProfile,
    call_timeout: Duration,
    leftovers: Leftovers,
) {
    let Leftovers {
        connection,
        notifications,
        mut latch,
    } = leftovers;
    let link = Link::new(transport, &connection, call_timeout);

    if latch.is_held() && connection.is_established() {
        warn!(
            "Buttons still held ({:?}), sending release",
            latch.held_phase()
        );
        if let Err(e) = release_buttons(&link, profile, &mut latch).await {
            warn!("Release during teardown failed: {}", e);
        }
    }

    if let Some(channel) = notifications {
        match disable_notifications(&link, channel).await {
            Ok(count) => debug!("Indications disabled ({} received)", count),
            Err(e) => warn!("Unsubscribe failed: {}", e),
        }
    }

    match link.disconnect().await {
        Ok(()) => info!("Disconnected. Physical buttons unlocked."),
        Err(e) => warn!("Disconnect from {} failed: {}", connection.address(), e),
    }
}

fn publish(
    state_tx: &watch::Sender<SessionState>,
    events: &mpsc::UnboundedSender<AppEvent>,
    state: SessionState,
) {
    state_tx.send_replace(state);
    // Nobody listening is fine, e.g. during shutdown
    let _ = events.send(AppEvent::SessionState(state));
}

fn report(events: &mpsc::UnboundedSender<AppEvent>, outcome: SessionOutcome) {
    if outcome.is_success() {
        info!("{}", outcome);
    } else {
        warn!("{}", outcome);
    }
    let _ = events.send(AppEvent::SessionFinished(outcome));
}

enum Interrupt {
    Finished(Result<(), SessionError>),
    TimedOut,
    Cancelled,
}

/// Per-request state. Owns the connection and the busy guard for its
/// lifetime; a background teardown takes the guard along.
struct Session<'a> {
    manager: &'a SessionManager,
    kind: SessionKind,
    started_at: DateTime<Local>,
    active: Option<OwnedMutexGuard<()>>,
    state: SessionState,
    connection: Option<Connection>,
    notifications: Option<NotificationChannel>,
    latch: ButtonLatch,
    needs_teardown: bool,
}

impl<'a> Session<'a> {
    fn new(manager: &'a SessionManager, kind: SessionKind, active: OwnedMutexGuard<()>) -> Self {
        Self {
            manager,
            kind,
            started_at: Local::now(),
            active: Some(active),
            state: SessionState::Disconnected,
            connection: None,
            notifications: None,
            latch: ButtonLatch::default(),
            needs_teardown: false,
        }
    }

    fn advance(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            error!("Illegal session transition {} -> {}", self.state, next);
        }
        debug!("Session state: {} -> {}", self.state, next);
        self.state = next;
        if next == SessionState::Connecting {
            self.needs_teardown = true;
        }
        self.manager.publish_state(next);
    }

    fn take_leftovers(&mut self) -> Option<Leftovers> {
        if !self.needs_teardown {
            return None;
        }
        self.needs_teardown = false;
        let connection = self
            .connection
            .take()
            .unwrap_or_else(|| Connection::unestablished(self.manager.config.address.clone()));
        Some(Leftovers {
            connection,
            notifications: self.notifications.take(),
            latch: std::mem::take(&mut self.latch),
        })
    }

    async fn run(&mut self) -> Result<(), SessionError> {
        let manager = self.manager;
        let kind = self.kind;
        let config = &manager.config;

        self.advance(SessionState::Connecting);
        info!("Connecting to camera {}", config.address);
        let connection = bounded(
            config.scan_timeout + config.call_timeout,
            manager.transport.connect(&config.address),
        )
        .await
        .map_err(SessionError::ConnectError)?;
        self.connection = Some(connection.clone());
        self.advance(SessionState::Connected);
        info!("Connected to camera!");

        let link = Link::new(&*manager.transport, &connection, config.call_timeout);

        if kind == SessionKind::DeviceInfo || config.read_device_info {
            match read_device_info(&link).await {
                Ok(device_info) => {
                    info!("\n{}", device_info);
                    manager.emit(AppEvent::DeviceInfo(device_info));
                }
                Err(e) if kind == SessionKind::DeviceInfo => {
                    return Err(SessionError::DeviceInfo(e))
                }
                Err(e) => warn!("Device info read failed, continuing: {}", e),
            }
        }
        if kind == SessionKind::DeviceInfo {
            return Ok(());
        }

        self.advance(SessionState::Handshaking);
        perform_handshake(&link, &config.profile, &config.handshake).await?;
        self.advance(SessionState::Ready);

        if manager.notifications_enabled() {
            enable_notifications(
                &link,
                &config.profile,
                manager.events.clone(),
                config.notification_settle,
                &mut self.notifications,
            )
            .await?;
        }

        self.advance(SessionState::Actuating);
        trigger_shutter(&link, &config.profile, &config.actuation, &mut self.latch).await
    }

    async fn finish(&mut self) {
        let Some(leftovers) = self.take_leftovers() else {
            return;
        };
        self.advance(SessionState::Disconnecting);
        let manager = self.manager;
        tear_down(
            &*manager.transport,
            &manager.config.profile,
            manager.config.call_timeout,
            leftovers,
        )
        .await;
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        let Some(leftovers) = self.take_leftovers() else {
            return;
        };
        let during = self.state;
        let message = format!(
            "Session dropped while {}, tearing down in the background",
            during
        );
        error!("{}", message);
        self.manager.emit(AppEvent::LogMessage(StatusMessage {
            message,
            severity: MessageSeverity::Error,
        }));
        self.advance(SessionState::Disconnecting);

        let manager = self.manager;
        let state_tx = manager.state.clone();
        let events = manager.events.clone();
        let (kind, started_at) = (self.kind, self.started_at);
        let finish = move || {
            publish(&state_tx, &events, SessionState::Aborted);
            report(
                &events,
                SessionOutcome {
                    kind,
                    started_at,
                    finished_at: Local::now(),
                    final_state: SessionState::Aborted,
                    result: Err(SessionError::Cancelled { during }),
                },
            );
        };

        // The manager stays busy until the link is really gone
        let active = self.active.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let transport = manager.transport.clone();
                let profile = manager.config.profile.clone();
                let call_timeout = manager.config.call_timeout;
                handle.spawn(async move {
                    tear_down(&*transport, &profile, call_timeout, leftovers).await;
                    finish();
                    drop(active);
                });
            }
            Err(_) => {
                error!(
                    "No runtime left to tear down the link to {}",
                    leftovers.connection.address()
                );
                finish();
            }
        }
    }
}

/// Main coordinator: runs one session per request
pub struct SessionManager {
    transport: Arc<dyn BleTransport>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<AppEvent>,
    active: Arc<Mutex<()>>,
    notifications: AtomicBool,
    state: Arc<watch::Sender<SessionState>>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        config: SessionConfig,
        events: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            transport,
            notifications: AtomicBool::new(config.enable_notifications),
            config,
            events,
            active: Arc::new(Mutex::new(())),
            state: Arc::new(state),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// State of the current (or last) session.
    ///
    /// `Aborted` describes how the last session ended, not the manager: a
    /// new request is accepted as soon as `is_busy()` is false.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_busy(&self) -> bool {
        self.active.try_lock().is_err()
    }

    pub fn notifications_enabled(&self) -> bool {
        self.notifications.load(Ordering::Relaxed)
    }

    /// Applies to sessions started after the call
    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.notifications.store(enabled, Ordering::Relaxed);
        let message = format!(
            "Status notifications {} for the next session",
            if enabled { "enabled" } else { "disabled" }
        );
        info!("{}", message);
        self.emit(AppEvent::LogMessage(StatusMessage {
            message,
            severity: MessageSeverity::Info,
        }));
    }

    fn publish_state(&self, state: SessionState) {
        publish(&self.state, &self.events, state);
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.events.send(event);
    }

    pub async fn take_photo(&self) -> Result<(), SessionError> {
        self.take_photo_until(std::future::pending()).await
    }

    /// Take a photo, giving up (with full teardown) once `cancel` resolves
    pub async fn take_photo_until<C>(&self, cancel: C) -> Result<(), SessionError>
    where
        C: Future<Output = ()>,
    {
        self.run_session(SessionKind::TakePhoto, cancel).await
    }

    pub async fn read_device_info(&self) -> Result<(), SessionError> {
        self.read_device_info_until(std::future::pending()).await
    }

    pub async fn read_device_info_until<C>(&self, cancel: C) -> Result<(), SessionError>
    where
        C: Future<Output = ()>,
    {
        self.run_session(SessionKind::DeviceInfo, cancel).await
    }

    async fn run_session<C>(&self, kind: SessionKind, cancel: C) -> Result<(), SessionError>
    where
        C: Future<Output = ()>,
    {
        let Ok(active) = self.active.clone().try_lock_owned() else {
            warn!("Rejecting {} request: a session is already active", kind);
            self.emit(AppEvent::LogMessage(StatusMessage {
                message: format!("Busy: {} ignored while a session is active", kind),
                severity: MessageSeverity::Warning,
            }));
            return Err(SessionError::SessionBusy);
        };

        let mut session = Session::new(self, kind, active);

        let interrupt = {
            let body = session.run();
            tokio::select! {
                biased;
                finished = tokio::time::timeout(self.config.session_timeout, body) => match finished {
                    Ok(result) => Interrupt::Finished(result),
                    Err(_) => Interrupt::TimedOut,
                },
                _ = cancel => Interrupt::Cancelled,
            }
        };

        let result = match interrupt {
            Interrupt::Finished(result) => result,
            Interrupt::TimedOut => Err(SessionError::TransportTimeout {
                during: session.state,
            }),
            Interrupt::Cancelled => Err(SessionError::Cancelled {
                during: session.state,
            }),
        };
        if let Err(e) = &result {
            error!("Session aborted while {}: {}", session.state, e);
        }

        session.finish().await;
        session.advance(if result.is_ok() {
            SessionState::Disconnected
        } else {
            SessionState::Aborted
        });

        report(
            &self.events,
            SessionOutcome {
                kind,
                started_at: session.started_at,
                finished_at: Local::now(),
                final_state: session.state,
                result: result.clone(),
            },
        );

        // Dropping the session releases the busy guard
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::infrastructure::bluetooth::fake_transport::{FakeTransport, FaultPoint, TransportCall};
    use crate::infrastructure::bluetooth::protocol::ActuationPhase;
    use crate::infrastructure::bluetooth::transport::WriteMode;

    fn address() -> PeripheralAddress {
        PeripheralAddress::parse("DC:FE:23:4A:E0:36").unwrap()
    }

    fn setup(
        transport: &Arc<FakeTransport>,
        configure: impl FnOnce(&mut SessionConfig),
    ) -> (SessionManager, mpsc::UnboundedReceiver<AppEvent>) {
        let mut config = SessionConfig::new(address());
        configure(&mut config);
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionManager::new(transport.clone(), config, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[AppEvent]) -> Vec<SessionState> {
        events
            .iter()
            .filter_map(|e| match e {
                AppEvent::SessionState(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    fn shutter_bytes(transport: &FakeTransport) -> Vec<u8> {
        transport
            .writes_to(GattProfile::default().shutter)
            .into_iter()
            .flat_map(|(payload, _)| payload)
            .collect()
    }

    fn outcome(events: &[AppEvent]) -> &SessionOutcome {
        let outcomes: Vec<&SessionOutcome> = events
            .iter()
            .filter_map(|e| match e {
                AppEvent::SessionFinished(o) => Some(o),
                _ => None,
            })
            .collect();
        assert_eq!(outcomes.len(), 1, "exactly one outcome per session");
        outcomes[0]
    }

    #[tokio::test(start_paused = true)]
    async fn test_photo_session_success() {
        let transport = Arc::new(FakeTransport::new());
        let (manager, mut rx) = setup(&transport, |_| {});
        let profile = GattProfile::default();

        manager.take_photo().await.unwrap();

        assert_eq!(
            transport.calls(),
            vec![
                TransportCall::Connect(address()),
                TransportCall::Write {
                    characteristic: profile.pairing,
                    payload: b"\x03LINUX".to_vec(),
                    mode: WriteMode::WithResponse,
                },
                TransportCall::Write {
                    characteristic: profile.shutter,
                    payload: vec![0x0C],
                    mode: WriteMode::WithoutResponse,
                },
                TransportCall::Write {
                    characteristic: profile.shutter,
                    payload: vec![0x8C],
                    mode: WriteMode::WithoutResponse,
                },
                TransportCall::Write {
                    characteristic: profile.shutter,
                    payload: vec![0x00],
                    mode: WriteMode::WithoutResponse,
                },
                TransportCall::Disconnect,
            ]
        );
        let writes = transport.writes_to(profile.shutter);
        assert!(writes[1].1 - writes[0].1 >= Duration::from_millis(300));

        let events = drain(&mut rx);
        assert_eq!(
            states(&events),
            vec![
                SessionState::Connecting,
                SessionState::Connected,
                SessionState::Handshaking,
                SessionState::Ready,
                SessionState::Actuating,
                SessionState::Disconnecting,
                SessionState::Disconnected,
            ]
        );
        let outcome = outcome(&events);
        assert!(outcome.is_success());
        assert_eq!(outcome.final_state, SessionState::Disconnected);
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(!manager.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_failure_skips_shutter() {
        let transport = Arc::new(FakeTransport::new());
        let profile = GattProfile::default();
        transport.fail_on(FaultPoint::Write {
            characteristic: profile.pairing,
            payload: None,
        });
        let (manager, mut rx) = setup(&transport, |_| {});

        let err = manager.take_photo().await.unwrap_err();

        assert!(matches!(err, SessionError::HandshakeFailed(_)));
        assert!(transport.writes_to(profile.shutter).is_empty());
        assert_eq!(transport.disconnect_count(), 1);
        assert_eq!(transport.calls().last(), Some(&TransportCall::Disconnect));

        let events = drain(&mut rx);
        assert_eq!(outcome(&events).final_state, SessionState::Aborted);
        let states = states(&events);
        assert_eq!(
            states[states.len() - 2..],
            [SessionState::Disconnecting, SessionState::Aborted]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_are_delivered_and_torn_down_before_disconnect() {
        let transport = Arc::new(FakeTransport::new());
        let profile = GattProfile::default();
        transport.notify_after_write(profile.shutter, vec![0x0C], profile.status, vec![0xAA, 0xBB]);
        let (manager, mut rx) = setup(&transport, |c| c.enable_notifications = true);

        manager.take_photo().await.unwrap();

        let calls = transport.calls();
        assert_eq!(
            calls[2],
            TransportCall::Write {
                characteristic: profile.status_cccd,
                payload: vec![0x02, 0x00],
                mode: WriteMode::WithResponse,
            }
        );
        assert_eq!(calls[3], TransportCall::Subscribe(profile.status));
        let unsubscribe = calls
            .iter()
            .position(|c| *c == TransportCall::Unsubscribe(profile.status))
            .unwrap();
        let disconnect = calls
            .iter()
            .position(|c| *c == TransportCall::Disconnect)
            .unwrap();
        assert!(unsubscribe < disconnect);
        assert_eq!(transport.unsubscribe_count(), 1);
        assert_eq!(transport.disconnect_count(), 1);

        let notifications: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                AppEvent::Notification(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].payload, vec![0xAA, 0xBB]);
        assert_eq!(notifications[0].source, profile.status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_still_disconnects_once() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_on(FaultPoint::Connect);
        let (manager, mut rx) = setup(&transport, |_| {});

        let err = manager.take_photo().await.unwrap_err();

        assert!(matches!(err, SessionError::ConnectError(_)));
        assert_eq!(
            transport.calls(),
            vec![TransportCall::Connect(address()), TransportCall::Disconnect]
        );
        assert_eq!(
            states(&drain(&mut rx)),
            vec![
                SessionState::Connecting,
                SessionState::Disconnecting,
                SessionState::Aborted,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_aborts_before_actuation() {
        let transport = Arc::new(FakeTransport::new());
        let profile = GattProfile::default();
        transport.fail_on(FaultPoint::Subscribe(profile.status));
        let (manager, _rx) = setup(&transport, |c| c.enable_notifications = true);

        let err = manager.take_photo().await.unwrap_err();

        assert!(matches!(err, SessionError::SubscribeError(_)));
        assert!(transport.writes_to(profile.shutter).is_empty());
        assert_eq!(transport.unsubscribe_count(), 0);
        assert_eq!(transport.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_any_shutter_failure_cleans_up_exactly_once() {
        let profile = GattProfile::default();
        let cases = [
            (0x0C, ActuationPhase::Focus),
            (0x8C, ActuationPhase::ShutterAndFocus),
            (0x00, ActuationPhase::Release),
        ];

        for (byte, expected_phase) in cases {
            let transport = Arc::new(FakeTransport::new());
            transport.fail_on(FaultPoint::Write {
                characteristic: profile.shutter,
                payload: Some(vec![byte]),
            });
            let (manager, _rx) = setup(&transport, |c| c.enable_notifications = true);

            let err = manager.take_photo().await.unwrap_err();

            match err {
                SessionError::ActuationWriteFailed { phase, .. } => {
                    assert_eq!(phase, expected_phase)
                }
                other => panic!("unexpected error for {:#04X}: {:?}", byte, other),
            }
            assert_eq!(shutter_bytes(&transport), vec![0x0C, 0x8C, 0x00]);
            assert_eq!(transport.unsubscribe_count(), 1);
            assert_eq!(transport.disconnect_count(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_while_active_is_busy() {
        let transport = Arc::new(FakeTransport::new().with_latency(Duration::from_millis(50)));
        let (manager, _rx) = setup(&transport, |_| {});

        let (first, second) = tokio::join!(manager.take_photo(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(manager.is_busy());
            manager.take_photo().await
        });

        assert!(first.is_ok());
        assert_eq!(second, Err(SessionError::SessionBusy));
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(transport.disconnect_count(), 1);

        // Once idle a new session is accepted
        manager.take_photo().await.unwrap();
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_timeout_during_focus_delay_releases() {
        let transport = Arc::new(FakeTransport::new());
        let (manager, mut rx) = setup(&transport, |c| {
            c.session_timeout = Duration::from_millis(150);
        });

        let err = manager.take_photo().await.unwrap_err();

        assert_eq!(
            err,
            SessionError::TransportTimeout {
                during: SessionState::Actuating
            }
        );
        assert_eq!(shutter_bytes(&transport), vec![0x0C, 0x00]);
        assert_eq!(transport.calls().last(), Some(&TransportCall::Disconnect));
        assert_eq!(transport.disconnect_count(), 1);
        assert_eq!(outcome(&drain(&mut rx)).final_state, SessionState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_write_hits_call_timeout() {
        let transport = Arc::new(FakeTransport::new());
        let profile = GattProfile::default();
        transport.hang_on(FaultPoint::Write {
            characteristic: profile.pairing,
            payload: None,
        });
        let (manager, _rx) = setup(&transport, |c| {
            c.call_timeout = Duration::from_millis(200);
        });

        let err = manager.take_photo().await.unwrap_err();

        assert_eq!(
            err,
            SessionError::HandshakeFailed(TransportError::Timeout(Duration::from_millis(200)))
        );
        assert_eq!(transport.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_unwinds_with_cleanup() {
        let transport = Arc::new(FakeTransport::new());
        let (manager, _rx) = setup(&transport, |c| c.enable_notifications = true);

        // Lands inside the 500 ms notification settle
        let err = manager
            .take_photo_until(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SessionError::Cancelled {
                during: SessionState::Ready
            }
        );
        assert!(shutter_bytes(&transport).is_empty());
        assert_eq!(transport.unsubscribe_count(), 1);
        assert_eq!(transport.disconnect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_tears_down_in_background() {
        let transport = Arc::new(FakeTransport::new());
        let (manager, mut rx) = setup(&transport, |_| {});

        let dropped = tokio::time::timeout(Duration::from_millis(100), manager.take_photo()).await;
        assert!(dropped.is_err());

        // Teardown has not run yet, so the link still belongs to the old session
        assert!(manager.is_busy());
        assert_eq!(manager.take_photo().await, Err(SessionError::SessionBusy));
        assert_eq!(transport.connect_count(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(shutter_bytes(&transport), vec![0x0C, 0x00]);
        assert_eq!(transport.disconnect_count(), 1);
        assert_eq!(manager.state(), SessionState::Aborted);
        assert!(!manager.is_busy());

        let events = drain(&mut rx);
        let outcome = outcome(&events);
        assert_eq!(outcome.final_state, SessionState::Aborted);
        assert_eq!(
            outcome.result,
            Err(SessionError::Cancelled {
                during: SessionState::Actuating
            })
        );
        let states = states(&events);
        assert_eq!(
            states[states.len() - 2..],
            [SessionState::Disconnecting, SessionState::Aborted]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_session_waits_for_background_teardown() {
        let transport = Arc::new(FakeTransport::new().with_latency(Duration::from_millis(20)));
        let (manager, _rx) = setup(&transport, |_| {});

        // Dropped during the focus delay; teardown then needs two 20 ms calls
        let dropped = tokio::time::timeout(Duration::from_millis(100), manager.take_photo()).await;
        assert!(dropped.is_err());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.is_busy());
        assert_eq!(manager.take_photo().await, Err(SessionError::SessionBusy));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!manager.is_busy());
        manager.take_photo().await.unwrap();

        let calls = transport.calls();
        let first_disconnect = calls
            .iter()
            .position(|c| *c == TransportCall::Disconnect)
            .unwrap();
        let second_connect = calls
            .iter()
            .rposition(|c| matches!(c, TransportCall::Connect(_)))
            .unwrap();
        assert!(first_disconnect < second_connect);
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(transport.disconnect_count(), 2);
        assert_eq!(
            shutter_bytes(&transport),
            vec![0x0C, 0x00, 0x0C, 0x8C, 0x00]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_info_session() {
        let transport = Arc::new(FakeTransport::demo_camera());
        let (manager, mut rx) = setup(&transport, |_| {});

        manager.read_device_info().await.unwrap();

        let events = drain(&mut rx);
        let info = events
            .iter()
            .find_map(|e| match e {
                AppEvent::DeviceInfo(info) => Some(info.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(info.manufacturer, "Canon Inc.");
        assert!(transport
            .calls()
            .iter()
            .all(|c| !matches!(c, TransportCall::Write { .. })));
        assert_eq!(transport.disconnect_count(), 1);
        assert_eq!(outcome(&events).kind, SessionKind::DeviceInfo);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_diagnostic_read_does_not_abort_photo() {
        let transport = Arc::new(FakeTransport::new());
        let (manager, _rx) = setup(&transport, |c| c.read_device_info = true);

        manager.take_photo().await.unwrap();
        assert_eq!(shutter_bytes(&transport), vec![0x0C, 0x8C, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifications_toggle_applies_to_next_session() {
        let transport = Arc::new(FakeTransport::new());
        let (manager, _rx) = setup(&transport, |_| {});
        assert!(!manager.notifications_enabled());

        manager.set_notifications_enabled(true);
        manager.take_photo().await.unwrap();

        assert_eq!(
            transport.count(|c| matches!(c, TransportCall::Subscribe(_))),
            1
        );
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.camera_address = "aa:bb:cc:dd:ee:ff".to_string();
        settings.focus_delay_ms = 100;
        settings.release_delay_ms = 40;

        let config = SessionConfig::try_from(&settings).unwrap();
        assert_eq!(config.address.as_str(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(config.actuation.focus_delay, MIN_FOCUS_DELAY);
        assert_eq!(config.actuation.release_delay, Duration::from_millis(40));
        assert_eq!(config.profile, GattProfile::default());
        assert_eq!(config.handshake, HandshakePayload::default());

        settings.ble_shutter_char_uuid = "bogus".to_string();
        assert!(matches!(
            SessionConfig::try_from(&settings),
            Err(ConfigError::InvalidUuid {
                field: "ble_shutter_char_uuid",
                ..
            })
        ));
    }
}
