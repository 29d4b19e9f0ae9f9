use crate::domain::session_state::SessionState;
use crate::infrastructure::bluetooth::protocol::{ActuationPhase, CharacteristicId};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a [`BleTransport`](crate::infrastructure::bluetooth::transport::BleTransport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no bluetooth adapter available")]
    NoAdapter,

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("not connected")]
    NotConnected,

    #[error("characteristic {0} not found on device")]
    CharacteristicNotFound(CharacteristicId),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("bluetooth backend error: {0}")]
    Backend(String),

    #[error("injected failure: {0}")]
    Injected(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => Self::NotConnected,
            btleplug::Error::DeviceNotFound => Self::DeviceNotFound("unknown".to_string()),
            btleplug::Error::TimedOut(d) => Self::Timeout(d),
            other => Self::Backend(other.to_string()),
        }
    }
}

/// Errors surfaced by a camera session. Transport errors are wrapped with
/// the phase that produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("connect failed: {0}")]
    ConnectError(#[source] TransportError),

    #[error("handshake failed: {0}")]
    HandshakeFailed(#[source] TransportError),

    #[error("actuation write failed during {phase}: {source}")]
    ActuationWriteFailed {
        phase: ActuationPhase,
        source: TransportError,
    },

    #[error("enabling notifications failed: {0}")]
    SubscribeError(#[source] TransportError),

    #[error("device info read failed: {0}")]
    DeviceInfo(#[source] TransportError),

    #[error("session timed out while {during}")]
    TransportTimeout { during: SessionState },

    #[error("session cancelled while {during}")]
    Cancelled { during: SessionState },

    #[error("a session is already active")]
    SessionBusy,
}

/// Invalid values in the settings file.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("camera address is empty")]
    EmptyAddress,

    #[error("invalid characteristic uuid for {field}: {value}")]
    InvalidUuid { field: &'static str, value: String },

    #[error("device name must be 1-{max} ASCII characters, got {0:?}", max = crate::infrastructure::bluetooth::handshake::MAX_DEVICE_NAME_LEN)]
    InvalidDeviceName(String),
}
