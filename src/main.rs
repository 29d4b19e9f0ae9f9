mod domain;
mod error;
mod infrastructure;
mod presentation;

use crate::domain::settings::SettingsService;
use crate::infrastructure::bluetooth::btleplug_transport::BtleplugTransport;
use crate::infrastructure::bluetooth::fake_transport::FakeTransport;
use crate::infrastructure::bluetooth::transport::BleTransport;
use crate::infrastructure::bluetooth::{SessionConfig, SessionManager};
use crate::infrastructure::logging::init_logger;
use crate::presentation::console::{print_events, ConsoleApp};
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings_service = SettingsService::new()?;
    // Before env overrides, so CAMERA_ADDR never lands in the file
    let wrote_template = settings_service.write_if_missing();
    settings_service.apply_env_overrides();
    let settings = settings_service.get().clone();

    let _logging_guard =
        init_logger(&settings.log_settings).context("Failed to initialize logging")?;
    info!("Starting Canon BLE Remote");
    info!("Settings: {}", settings_service.path().display());
    match wrote_template {
        Ok(true) => info!("Wrote default settings, edit camera_address there"),
        Ok(false) => {}
        Err(e) => warn!("Could not write default settings: {:#}", e),
    }

    let config = SessionConfig::try_from(&settings).context("Invalid settings")?;

    let transport: Arc<dyn BleTransport> = if settings.dry_run {
        warn!("Dry run: talking to a simulated camera");
        Arc::new(FakeTransport::demo_camera())
    } else {
        Arc::new(
            BtleplugTransport::new(config.scan_timeout, config.profile.status_cccd)
                .await
                .context("Failed to initialize Bluetooth")?,
        )
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_events(events_rx));
    let manager = Arc::new(SessionManager::new(transport, config, events_tx));

    ConsoleApp::new(manager).run().await?;

    // The manager (and with it the last event sender) is gone, so the
    // printer drains and exits
    printer.await.context("Event printer panicked")?;
    info!("Bye");
    Ok(())
}
