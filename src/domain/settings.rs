use crate::domain::models::FirmwareVariant;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
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
    "ir40_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// How command payloads are written to the write characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandWriteType {
    /// Write without response
    #[default]
    Command,
    /// Write with response
    Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Device
    #[serde(default)]
    pub last_device_address: Option<String>,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default)]
    pub measurement_field: FirmwareVariant,

    // Advanced BLE Settings
    #[serde(default = "default_write_uuid")]
    pub write_char_uuid: String,
    #[serde(default = "default_notify_uuid")]
    pub notify_char_uuid: String,
    #[serde(default)]
    pub command_write_type: CommandWriteType,

    // Session timing
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_services_poll_interval_ms")]
    pub services_poll_interval_ms: u64,
    #[serde(default = "default_services_poll_max_attempts")]
    pub services_poll_max_attempts: u32,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_notification_queue_capacity")]
    pub notification_queue_capacity: usize,

    // Output
    #[serde(default = "default_true")]
    pub type_measurements: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            last_device_address: None,
            discovery_timeout_ms: default_discovery_timeout_ms(),
            measurement_field: FirmwareVariant::default(),
            write_char_uuid: default_write_uuid(),
            notify_char_uuid: default_notify_uuid(),
            command_write_type: CommandWriteType::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            services_poll_interval_ms: default_services_poll_interval_ms(),
            services_poll_max_attempts: default_services_poll_max_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            notification_queue_capacity: default_notification_queue_capacity(),
            type_measurements: default_true(),
        }
    }
}

fn default_write_uuid() -> String {
    protocol::WRITE_CHAR_UUID.to_string()
}
fn default_notify_uuid() -> String {
    protocol::NOTIFY_CHAR_UUID.to_string()
}
fn default_discovery_timeout_ms() -> u64 {
    5_000
}
fn default_connect_timeout_ms() -> u64 {
    15_000
}
fn default_services_poll_interval_ms() -> u64 {
    500
}
fn default_services_poll_max_attempts() -> u32 {
    30
}
fn default_heartbeat_interval_ms() -> u64 {
    25_000
}
fn default_write_timeout_ms() -> u64 {
    5_000
}
fn default_notification_queue_capacity() -> usize {
    64
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults if it is missing or invalid
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
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
        path.push("IR40Bridge");
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

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Remember the device picked by the user for the next run
    pub fn set_last_device(&mut self, address: &str) -> anyhow::Result<()> {
        if self.settings.last_device_address.as_deref() != Some(address) {
            self.settings.last_device_address = Some(address.to_string());
            self.save()?;
        }
        Ok(())
    }
}
