//! Camera Remote Protocol
//!
//! This module contains the protocol definitions for communicating with
//! the camera's remote-control GATT service.

use crate::error::ConfigError;
use std::fmt;
use uuid::Uuid;

/// Pairing/handshake characteristic (handle 0x0017)
pub const PAIRING_CHAR_UUID: &str = "00050002-0000-1000-0000-d8492fffa821";

/// Shutter/focus button characteristic (handle 0x0019)
pub const SHUTTER_CHAR_UUID: &str = "00050003-0000-1000-0000-d8492fffa821";

/// Status characteristic that sends indications (handle 0x001B)
pub const STATUS_CHAR_UUID: &str = "00050004-0000-1000-0000-d8492fffa821";

/// Status configuration characteristic (handle 0x001E)
pub const STATUS_CCCD_UUID: &str = "00050005-0000-1000-0000-d8492fffa821";

/// Enable-indications bitmask written to the status configuration characteristic
pub const ENABLE_INDICATIONS: [u8; 2] = [0x02, 0x00];

/// Button bits understood by the shutter characteristic
pub mod buttons {
    /// Full press ("release the shutter")
    pub const RELEASE: u8 = 0x80;
    /// Half press, act immediately (focus)
    pub const IMMEDIATE: u8 = 0x0C;
}

/// Opaque GATT characteristic identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicId(Uuid);

impl CharacteristicId {
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// 16-bit SIG assigned number on the Bluetooth base UUID
    pub const fn from_short(short: u16) -> Self {
        Self::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
    }

    pub fn parse(field: &'static str, value: &str) -> Result<Self, ConfigError> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|_| ConfigError::InvalidUuid {
                field,
                value: value.to_string(),
            })
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Standard Device Information Service characteristics
pub mod device_info {
    use super::CharacteristicId;

    pub const MANUFACTURER_NAME: CharacteristicId = CharacteristicId::from_short(0x2A29);
    pub const MODEL_NUMBER: CharacteristicId = CharacteristicId::from_short(0x2A24);
    pub const SERIAL_NUMBER: CharacteristicId = CharacteristicId::from_short(0x2A26);
    pub const SOFTWARE_REVISION: CharacteristicId = CharacteristicId::from_short(0x2A28);
}

/// The vendor characteristics used by one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattProfile {
    pub pairing: CharacteristicId,
    pub shutter: CharacteristicId,
    pub status: CharacteristicId,
    pub status_cccd: CharacteristicId,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            pairing: CharacteristicId::from_u128(0x00050002_0000_1000_0000_d8492fffa821),
            shutter: CharacteristicId::from_u128(0x00050003_0000_1000_0000_d8492fffa821),
            status: CharacteristicId::from_u128(0x00050004_0000_1000_0000_d8492fffa821),
            status_cccd: CharacteristicId::from_u128(0x00050005_0000_1000_0000_d8492fffa821),
        }
    }
}

impl GattProfile {
    /// Human readable role of a characteristic, for logs
    pub fn role_of(&self, id: CharacteristicId) -> &'static str {
        match id {
            id if id == self.pairing => "pairing",
            id if id == self.shutter => "shutter",
            id if id == self.status => "status",
            id if id == self.status_cccd => "status-cccd",
            id if id == device_info::MANUFACTURER_NAME => "manufacturer",
            id if id == device_info::MODEL_NUMBER => "model",
            id if id == device_info::SERIAL_NUMBER => "serial",
            id if id == device_info::SOFTWARE_REVISION => "software",
            _ => "unknown",
        }
    }
}

/// Button state written to the shutter characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActuationPhase {
    /// Nothing pressed (resting state)
    Idle,
    /// Half press
    Focus,
    /// Full press while holding focus
    ShutterAndFocus,
    /// Let go of all buttons
    Release,
}

impl ActuationPhase {
    /// The single-byte bitmask for this phase
    pub fn bitmask(&self) -> u8 {
        match self {
            Self::Idle | Self::Release => 0x00,
            Self::Focus => buttons::IMMEDIATE,
            Self::ShutterAndFocus => buttons::RELEASE | buttons::IMMEDIATE,
        }
    }

    /// Phase that must follow this one
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Idle => Some(Self::Focus),
            Self::Focus => Some(Self::ShutterAndFocus),
            Self::ShutterAndFocus => Some(Self::Release),
            Self::Release => None,
        }
    }
}

impl fmt::Display for ActuationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Focus => "focus",
            Self::ShutterAndFocus => "shutter+focus",
            Self::Release => "release",
        };
        f.write_str(label)
    }
}

/// Lower-case hex rendering used for notification payloads
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
