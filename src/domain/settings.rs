use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Bounds for the full-travel setting, in seconds.
pub const MIN_FULL_TRAVEL_SECONDS: u32 = 5;
pub const MAX_FULL_TRAVEL_SECONDS: u32 = 120;
pub const DEFAULT_FULL_TRAVEL_SECONDS: u32 = 30;

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
    "octo_bed".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Bluetooth address of the bed, e.g. "AA:BB:CC:DD:EE:FF"
    #[serde(default)]
    pub device_address: Option<String>,
    /// 4-digit PIN shown on the bed remote
    #[serde(default)]
    pub pin: Option<String>,
    #[serde(default = "default_full_travel_seconds")]
    pub full_travel_seconds: u32,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Timing
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    #[serde(default = "default_command_spacing_ms")]
    pub command_spacing_ms: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_address: None,
            pin: None,
            full_travel_seconds: default_full_travel_seconds(),
            log_settings: LogSettings::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            command_spacing_ms: default_command_spacing_ms(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

fn default_full_travel_seconds() -> u32 {
    DEFAULT_FULL_TRAVEL_SECONDS
}
fn default_connect_timeout_ms() -> u64 {
    15_000
}
fn default_ack_timeout_ms() -> u64 {
    5_000
}
fn default_keep_alive_interval_ms() -> u64 {
    20_000
}
fn default_command_spacing_ms() -> u64 {
    200
}
fn default_tick_interval_ms() -> u64 {
    500
}

/// Clamp a full-travel value into the supported range.
pub fn clamp_full_travel_seconds(seconds: u32) -> u32 {
    seconds.clamp(MIN_FULL_TRAVEL_SECONDS, MAX_FULL_TRAVEL_SECONDS)
}

/// Runtime timing parameters for one bed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BedConfig {
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
    /// Must stay shorter than the bed's own PIN expiry window.
    pub keep_alive_interval: Duration,
    pub command_spacing: Duration,
    pub tick_interval: Duration,
    pub full_travel_seconds: u32,
}

impl Default for BedConfig {
    fn default() -> Self {
        Settings::default().bed_config()
    }
}

impl Settings {
    pub fn bed_config(&self) -> BedConfig {
        BedConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            keep_alive_interval: Duration::from_millis(self.keep_alive_interval_ms),
            command_spacing: Duration::from_millis(self.command_spacing_ms),
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            full_travel_seconds: clamp_full_travel_seconds(self.full_travel_seconds),
        }
    }
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

    /// Load from an explicit path, falling back to defaults when missing or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("OctoBed");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn update_full_travel(&mut self, seconds: u32) -> anyhow::Result<u32> {
        let seconds = clamp_full_travel_seconds(seconds);
        self.settings.full_travel_seconds = seconds;
        self.save()?;
        Ok(seconds)
    }

    pub fn remember_device(&mut self, address: &str, pin: &str) -> anyhow::Result<()> {
        self.settings.device_address = Some(address.to_string());
        self.settings.pin = Some(pin.to_string());
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BedConfig::default();
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
        assert_eq!(config.keep_alive_interval, Duration::from_secs(20));
        assert_eq!(config.command_spacing, Duration::from_millis(200));
        assert_eq!(config.tick_interval, Duration::from_millis(500));
        assert_eq!(config.full_travel_seconds, 30);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"device_address":"AA:BB","full_travel_seconds":45}"#)
                .unwrap();
        assert_eq!(settings.device_address.as_deref(), Some("AA:BB"));
        assert_eq!(settings.full_travel_seconds, 45);
        assert_eq!(settings.ack_timeout_ms, 5_000);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_full_travel_is_clamped() {
        let settings = Settings {
            full_travel_seconds: 500,
            ..Default::default()
        };
        assert_eq!(settings.bed_config().full_travel_seconds, 120);
        assert_eq!(clamp_full_travel_seconds(1), 5);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!("octo_bed_settings_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");

        let mut service = SettingsService::with_path(path.clone());
        service.remember_device("AA:BB:CC:DD:EE:FF", "1234").unwrap();
        assert_eq!(service.update_full_travel(200).unwrap(), 120);

        let reloaded = SettingsService::with_path(path);
        assert_eq!(
            reloaded.get().device_address.as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(reloaded.get().pin.as_deref(), Some("1234"));
        assert_eq!(reloaded.get().full_travel_seconds, 120);

        fs::remove_dir_all(&dir).ok();
    }
}
