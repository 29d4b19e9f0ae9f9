use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "canon_ble_remote".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default = "default_camera_address")]
    pub camera_address: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Session behaviour
    #[serde(default = "default_false")]
    pub enable_notifications: bool,
    #[serde(default = "default_false")]
    pub read_device_info: bool,
    /// Use the in-memory transport instead of a real adapter
    #[serde(default = "default_false")]
    pub dry_run: bool,

    // Timing (milliseconds)
    #[serde(default = "default_focus_delay_ms")]
    pub focus_delay_ms: u64,
    #[serde(default)]
    pub release_delay_ms: u64,
    #[serde(default = "default_notification_settle_ms")]
    pub notification_settle_ms: u64,
    #[serde(default = "default_transport_timeout_ms")]
    pub transport_timeout_ms: u64,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,

    // Advanced BLE Settings
    #[serde(default = "default_pairing_uuid")]
    pub ble_pairing_char_uuid: String,
    #[serde(default = "default_shutter_uuid")]
    pub ble_shutter_char_uuid: String,
    #[serde(default = "default_status_uuid")]
    pub ble_status_char_uuid: String,
    #[serde(default = "default_status_cccd_uuid")]
    pub ble_status_cccd_uuid: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            camera_address: default_camera_address(),
            device_name: default_device_name(),
            log_settings: LogSettings::default(),

            enable_notifications: false,
            read_device_info: false,
            dry_run: false,

            focus_delay_ms: default_focus_delay_ms(),
            release_delay_ms: 0,
            notification_settle_ms: default_notification_settle_ms(),
            transport_timeout_ms: default_transport_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            scan_timeout_ms: default_scan_timeout_ms(),

            ble_pairing_char_uuid: default_pairing_uuid(),
            ble_shutter_char_uuid: default_shutter_uuid(),
            ble_status_char_uuid: default_status_uuid(),
            ble_status_cccd_uuid: default_status_cccd_uuid(),
        }
    }
}

fn default_camera_address() -> String {
    "DC:FE:23:4A:E0:36".to_string()
}
fn default_device_name() -> String {
    "LINUX".to_string()
}
fn default_focus_delay_ms() -> u64 {
    300
}
fn default_notification_settle_ms() -> u64 {
    500
}
fn default_transport_timeout_ms() -> u64 {
    5_000
}
fn default_session_timeout_ms() -> u64 {
    20_000
}
fn default_scan_timeout_ms() -> u64 {
    10_000
}
fn default_pairing_uuid() -> String {
    protocol::PAIRING_CHAR_UUID.to_string()
}
fn default_shutter_uuid() -> String {
    protocol::SHUTTER_CHAR_UUID.to_string()
}
fn default_status_uuid() -> String {
    protocol::STATUS_CHAR_UUID.to_string()
}
fn default_status_cccd_uuid() -> String {
    protocol::STATUS_CCCD_UUID.to_string()
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::open(settings_path))
    }

    /// Load settings from `path`, falling back to defaults when the file is
    /// missing or unreadable
    pub fn open(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}: {})",
                    settings_path.display(),
                    e
                );
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("CanonBleRemote");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    /// Write the current settings if no file exists yet, so there is
    /// something to edit. Returns whether a file was written.
    pub fn write_if_missing(&self) -> anyhow::Result<bool> {
        if self.settings_path.exists() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    #[cfg(test)]
    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Environment overrides applied on top of the file (`CAMERA_ADDR`)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(address) = std::env::var("CAMERA_ADDR") {
            if !address.trim().is_empty() {
                self.settings.camera_address = address;
            }
        }
    }
}
