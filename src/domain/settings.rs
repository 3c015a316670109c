use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
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
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
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
    "ac_infinity_ble".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// MAC address (or platform peripheral id) of the controller
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_device_name")]
    pub name: String,
    #[serde(default = "default_port_count")]
    pub port_count: u8,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            address: String::new(),
            name: default_device_name(),
            port_count: default_port_count(),
        }
    }
}

fn default_device_name() -> String {
    "AC Infinity Controller".to_string()
}
fn default_port_count() -> u8 {
    8
}

/// Byte layout spoken by a firmware family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireLayout {
    /// `[port0, power, speed]` in both directions
    StateTriplet,
    /// `[port0, 0x01|0x02, value]` in both directions
    IndexedOpcode,
    /// `[opcode, port1, value]` in both directions
    OpcodeTriplet,
    /// `2 * N` bytes: power flags then speeds
    PortBlock,
}

/// How the poller asks the device for fresh state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RefreshStrategy {
    /// Write a fixed frame; the answer arrives as notifications.
    RequestFrame { bytes: Vec<u8> },
    /// Read the state characteristic and decode the result directly.
    ReadCharacteristic,
}

/// GATT identifiers and byte layout of the active device family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSettings {
    #[serde(default = "default_layout")]
    pub layout: WireLayout,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Option<String>,
    #[serde(default = "default_write_uuid")]
    pub write_char_uuid: String,
    #[serde(default = "default_notify_uuid")]
    pub notify_char_uuid: Option<String>,
    /// Characteristic used by `ReadCharacteristic` refreshes. Falls back to the
    /// write characteristic when unset.
    #[serde(default)]
    pub read_char_uuid: Option<String>,
    #[serde(default = "default_refresh")]
    pub refresh: RefreshStrategy,
    /// Block frames carry a 4-byte temperature/humidity trailer
    #[serde(default = "default_false")]
    pub block_telemetry: bool,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self::primary()
    }
}

impl ProfileSettings {
    /// 69 Pro / outlet family: fe61 service, separate write and notify characteristics.
    pub fn primary() -> Self {
        Self {
            layout: default_layout(),
            service_uuid: default_service_uuid(),
            write_char_uuid: default_write_uuid(),
            notify_char_uuid: default_notify_uuid(),
            read_char_uuid: None,
            refresh: default_refresh(),
            block_telemetry: false,
        }
    }

    /// Alternate family with one read/write characteristic holding the whole port block.
    pub fn single_characteristic() -> Self {
        Self {
            layout: WireLayout::PortBlock,
            service_uuid: None,
            write_char_uuid: "0000fff2-0000-1000-8000-00805f9b34fb".to_string(),
            notify_char_uuid: None,
            read_char_uuid: None,
            refresh: RefreshStrategy::ReadCharacteristic,
            block_telemetry: false,
        }
    }
}

fn default_layout() -> WireLayout {
    WireLayout::StateTriplet
}
fn default_service_uuid() -> Option<String> {
    Some("0000fe61-0000-1000-8000-00805f9b34fb".to_string())
}
fn default_write_uuid() -> String {
    "0000fe62-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_notify_uuid() -> Option<String> {
    Some("0000fe63-0000-1000-8000-00805f9b34fb".to_string())
}
fn default_refresh() -> RefreshStrategy {
    RefreshStrategy::RequestFrame { bytes: vec![0xFF] }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Longest a command waits for the device lock; `None` waits forever
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: Option<u64>,
    /// How long the scanner looks for the address before giving up
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_attempts: default_connect_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            scan_timeout_ms: default_scan_timeout_ms(),
        }
    }
}

fn default_connect_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    5000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_write_timeout_ms() -> u64 {
    5000
}
fn default_lock_timeout_ms() -> Option<u64> {
    Some(30_000)
}
fn default_scan_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_poll_interval_secs(),
        }
    }
}

impl PollSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

fn default_poll_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsSettings {
    /// Hex-dump every frame at debug level
    #[serde(default = "default_false")]
    pub packet_logging: bool,
    /// Diff consecutive inbound frames to help map unknown bytes
    #[serde(default = "default_false")]
    pub learning_mode: bool,
    #[serde(default = "default_learning_window_ms")]
    pub learning_window_ms: u64,
    /// Append every frame as a JSON line to this file
    #[serde(default)]
    pub capture_file: Option<PathBuf>,
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            packet_logging: default_false(),
            learning_mode: default_false(),
            learning_window_ms: default_learning_window_ms(),
            capture_file: None,
        }
    }
}

fn default_learning_window_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub profile: ProfileSettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub polling: PollSettings,
    #[serde(default)]
    pub diagnostics: DiagnosticsSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
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

    /// Load from an explicit path, falling back to defaults when the file is
    /// missing or unreadable.
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
        path.push("ACInfinityBle");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_primary_family() {
        let settings = Settings::default();
        assert_eq!(settings.device.port_count, 8);
        assert_eq!(settings.profile.layout, WireLayout::StateTriplet);
        assert_eq!(
            settings.profile.write_char_uuid,
            "0000fe62-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            settings.profile.refresh,
            RefreshStrategy::RequestFrame { bytes: vec![0xFF] }
        );
        assert_eq!(settings.polling.interval(), Duration::from_secs(30));
        assert_eq!(settings.connection.connect_attempts, 3);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{
            "device": { "address": "AA:BB:CC:DD:EE:FF" },
            "profile": { "layout": "opcode_triplet" },
            "diagnostics": { "learning_mode": true }
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.device.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(settings.device.port_count, 8);
        assert_eq!(settings.profile.layout, WireLayout::OpcodeTriplet);
        assert!(settings.profile.notify_char_uuid.is_some());
        assert!(settings.diagnostics.learning_mode);
        assert_eq!(settings.diagnostics.learning_window_ms, 2000);
    }

    #[test]
    fn test_layout_names() {
        let layout: WireLayout = serde_json::from_str(r#""indexed_opcode""#).unwrap();
        assert_eq!(layout, WireLayout::IndexedOpcode);
        assert_eq!(
            serde_json::to_string(&WireLayout::StateTriplet).unwrap(),
            r#""state_triplet""#
        );
    }

    #[test]
    fn test_refresh_strategy_serde() {
        let json = r#"{ "kind": "read_characteristic" }"#;
        let refresh: RefreshStrategy = serde_json::from_str(json).unwrap();
        assert_eq!(refresh, RefreshStrategy::ReadCharacteristic);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::with_path(path.clone());
        service.get_mut().device.address = "11:22:33:44:55:66".to_string();
        service.get_mut().profile = ProfileSettings::single_characteristic();
        service.save().unwrap();

        let reloaded = SettingsService::with_path(path);
        assert_eq!(reloaded.get().device.address, "11:22:33:44:55:66");
        assert_eq!(reloaded.get().profile.layout, WireLayout::PortBlock);
        assert_eq!(
            reloaded.get().profile.refresh,
            RefreshStrategy::ReadCharacteristic
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let service = SettingsService::with_path(dir.path().join("nope.json"));
        assert!(service.get().device.address.is_empty());
    }
}
