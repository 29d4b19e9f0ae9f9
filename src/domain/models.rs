use crate::domain::session_state::SessionState;
use crate::error::{ConfigError, SessionError};
use crate::infrastructure::bluetooth::protocol::{to_hex, CharacteristicId};
use chrono::{DateTime, Local};
use std::fmt;

/// Millisecond ISO-8601 timestamp used for every user-visible report
pub fn format_timestamp(at: &DateTime<Local>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// Link-layer address of the camera, e.g. `DC:FE:23:4A:E0:36`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralAddress(String);

impl PeripheralAddress {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        Ok(Self(value.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.trim())
    }
}

impl fmt::Display for PeripheralAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A payload pushed by the camera on a subscribed characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub source: CharacteristicId,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Local>,
}

impl NotificationEvent {
    /// Stamp a payload with the time it was received
    pub fn received_now(source: CharacteristicId, payload: Vec<u8>) -> Self {
        Self {
            source,
            payload,
            received_at: Local::now(),
        }
    }

    pub fn payload_hex(&self) -> String {
        to_hex(&self.payload)
    }
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  [NOTIFY] source={}  payload={}",
            format_timestamp(&self.received_at),
            self.source,
            self.payload_hex()
        )
    }
}

/// Device Information Service strings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub software: String,
}

impl DeviceInfo {
    /// Render a characteristic value; empty reads show as `N/A`
    pub fn decode_field(raw: &[u8]) -> String {
        if raw.is_empty() {
            return "N/A".to_string();
        }
        String::from_utf8_lossy(raw)
            .trim_end_matches('\0')
            .to_string()
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Device Info ---")?;
        writeln!(f, "Manufacturer: {}", self.manufacturer)?;
        writeln!(f, "Model:        {}", self.model)?;
        writeln!(f, "Serial:       {}", self.serial)?;
        writeln!(f, "Software:     {}", self.software)?;
        write!(f, "-------------------")
    }
}

/// What a session was opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    TakePhoto,
    DeviceInfo,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TakePhoto => f.write_str("take-photo"),
            Self::DeviceInfo => f.write_str("device-info"),
        }
    }
}

/// Report of one finished session
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub kind: SessionKind,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub final_state: SessionState,
    pub result: Result<(), SessionError>,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = self.finished_at - self.started_at;
        match &self.result {
            Ok(()) => write!(
                f,
                "{} {} succeeded in {} ms",
                format_timestamp(&self.finished_at),
                self.kind,
                elapsed.num_milliseconds()
            ),
            Err(e) => write!(
                f,
                "{} {} failed after {} ms ({}): {}",
                format_timestamp(&self.finished_at),
                self.kind,
                elapsed.num_milliseconds(),
                self.final_state,
                e
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    SessionState(SessionState),
    Notification(NotificationEvent),
    DeviceInfo(DeviceInfo),
    SessionFinished(SessionOutcome),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Warning,
    Error,
}
