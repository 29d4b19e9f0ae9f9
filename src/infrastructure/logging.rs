//! Tracing setup for the remote
//!
//! The BLE stack underneath is chatty at `debug` (every advertisement seen
//! during a scan, every D-Bus property change), which buries the session
//! lines. Those targets are capped at `warn` unless the configured level
//! names them explicitly. `RUST_LOG` replaces the whole filter.

use crate::domain::settings::LogSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Crates under `btleplug` that log per advertisement or per D-Bus signal
const NOISY_BLE_TARGETS: &[&str] = &["btleplug", "bluez_async", "bluez_generated", "dbus"];

pub struct LoggingGuard {
    // Flushes the session log file on drop
    _file_writer: Option<WorkerGuard>,
}

fn parse_rotation(value: &str) -> Rotation {
    match value.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// Filter directives for the configured level, with the BLE stack capped
fn filter_directives(level: &str) -> String {
    let level = match level.trim() {
        "" => "info",
        level => level,
    };
    let mut directives = vec![level.to_string()];
    for target in NOISY_BLE_TARGETS {
        // An explicit `btleplug=trace` in the settings is kept as written
        if !level.split(',').any(|d| d.trim().starts_with(target)) {
            directives.push(format!("{}=warn", target));
        }
    }
    directives.join(",")
}

fn build_filter(settings: &LogSettings) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::try_new(filter_directives(&settings.level)).unwrap_or_else(|e| {
        eprintln!("Invalid log level {:?} ({}), using info", settings.level, e);
        EnvFilter::new(filter_directives("info"))
    })
}

pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let filter = build_filter(settings);

    // stderr, so log lines do not interleave with the command prompt
    let console_layer = settings.console_logging_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_ids(settings.show_thread_ids)
            .with_target(settings.show_target)
            .with_ansi(settings.ansi_colors)
    });

    let mut file_writer = None;
    let file_layer = if settings.file_logging_enabled {
        let appender = RollingFileAppender::new(
            parse_rotation(&settings.rotation),
            &settings.log_dir,
            &settings.file_name_prefix,
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        file_writer = Some(guard);
        Some(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_ids(settings.show_thread_ids)
                .with_target(settings.show_target),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    if settings.file_logging_enabled {
        tracing::info!(
            "Session log: {}/{}.*",
            settings.log_dir,
            settings.file_name_prefix
        );
    }

    Ok(LoggingGuard {
        _file_writer: file_writer,
    })
}
