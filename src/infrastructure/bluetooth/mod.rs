//! Bluetooth Module
//!
//! Drives a Canon camera's remote-shutter profile over BLE.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     SessionManager                       │
//! │  (one session at a time, guaranteed teardown)            │
//! └─────────────────────┬────────────────────────────────────┘
//!                       │
//!      ┌───────────┬────┴──────┬──────────────┐
//!      ▼           ▼           ▼              ▼
//! ┌──────────┐ ┌──────────┐ ┌─────────────┐ ┌─────────────┐
//! │Handshake │ │Actuation │ │Notifications│ │ Device info │
//! └────┬─────┘ └────┬─────┘ └──────┬──────┘ └──────┬──────┘
//!      └────────────┴──────┬───────┴───────────────┘
//!                          ▼
//!                ┌───────────────────┐
//!                │   BleTransport    │
//!                │ btleplug │ fake   │
//!                └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, button bitmasks and actuation phases
//! - [`transport`] - Transport contract and per-call deadlines
//! - [`handshake`] - Pairing announcement
//! - [`actuation`] - Focus / shutter / release sequence
//! - [`notifications`] - Status indications
//! - [`device_info`] - Device Information Service reads
//! - [`session`] - Session coordinator
//! - [`btleplug_transport`] - Real hardware backend
//! - [`fake_transport`] - In-memory backend for tests and dry runs

pub mod actuation;
pub mod btleplug_transport;
pub mod device_info;
pub mod fake_transport;
pub mod handshake;
pub mod notifications;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export main service for convenience
pub use session::{SessionConfig, SessionManager};
