//! Pairing handshake
//!
//! The camera only accepts button writes from a remote that has announced
//! itself on the pairing characteristic in the same connection. There is no
//! application-level answer; the link-layer acknowledgement is the only
//! confirmation we get.

use crate::error::{ConfigError, SessionError};
use crate::infrastructure::bluetooth::protocol::GattProfile;
use crate::infrastructure::bluetooth::transport::{Link, WriteMode};
use tracing::{debug, info};

/// ATT_MTU 23 leaves 20 bytes for a single write, one of which is the version
pub const MAX_DEVICE_NAME_LEN: usize = 19;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    device_name: String,
}

impl HandshakePayload {
    pub const VERSION: u8 = 0x03;

    pub fn new(device_name: &str) -> Result<Self, ConfigError> {
        if device_name.is_empty()
            || device_name.len() > MAX_DEVICE_NAME_LEN
            || !device_name.is_ascii()
        {
            return Err(ConfigError::InvalidDeviceName(device_name.to_string()));
        }
        Ok(Self {
            device_name: device_name.to_string(),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.device_name.len());
        bytes.push(Self::VERSION);
        bytes.extend_from_slice(self.device_name.as_bytes());
        bytes
    }
}

impl Default for HandshakePayload {
    fn default() -> Self {
        Self {
            device_name: "LINUX".to_string(),
        }
    }
}

/// Announce ourselves on the pairing characteristic (acknowledged write)
pub async fn perform_handshake(
    link: &Link<'_>,
    profile: &GattProfile,
    payload: &HandshakePayload,
) -> Result<(), SessionError> {
    let bytes = payload.to_bytes();
    debug!("Handshake payload: {:02X?}", bytes);

    link.write(profile.pairing, &bytes, WriteMode::WithResponse)
        .await
        .map_err(SessionError::HandshakeFailed)?;

    info!("Handshake complete as {:?}", payload.device_name());
    Ok(())
}
