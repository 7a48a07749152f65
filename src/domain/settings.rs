use crate::domain::models::{Platform, UNKNOWN_DEVICE_NAME};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

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
    "ble_workflow".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Tunables for scanning, connecting and notification coalescing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    /// Service UUIDs used to filter scans and connected-device lookups
    #[serde(default)]
    pub service_uuids: Vec<String>,
    #[serde(default = "default_scan_duration_secs")]
    pub scan_duration_secs: u32,
    /// Extra time granted to the native scan call before it is abandoned
    #[serde(default = "default_scan_guard_margin_ms")]
    pub scan_guard_margin_ms: u64,
    #[serde(default = "default_false")]
    pub allow_duplicates: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_discovery_throttle_ms")]
    pub discovery_throttle_ms: u64,
    #[serde(default = "default_state_update_throttle_ms")]
    pub state_update_throttle_ms: u64,
    #[serde(default = "default_unknown_device_name")]
    pub unknown_device_name: String,
    #[serde(default)]
    pub adapter_name: Option<String>,
}

impl BleSettings {
    pub fn scan_guard_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs as u64)
            + Duration::from_millis(self.scan_guard_margin_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discovery_throttle(&self) -> Duration {
        Duration::from_millis(self.discovery_throttle_ms)
    }

    pub fn state_update_throttle(&self) -> Duration {
        Duration::from_millis(self.state_update_throttle_ms)
    }
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuids: Vec::new(),
            scan_duration_secs: default_scan_duration_secs(),
            scan_guard_margin_ms: default_scan_guard_margin_ms(),
            allow_duplicates: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            discovery_throttle_ms: default_discovery_throttle_ms(),
            state_update_throttle_ms: default_state_update_throttle_ms(),
            unknown_device_name: default_unknown_device_name(),
            adapter_name: None,
        }
    }
}

fn default_scan_duration_secs() -> u32 {
    5
}
fn default_scan_guard_margin_ms() -> u64 {
    1000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_discovery_throttle_ms() -> u64 {
    1500
}
fn default_state_update_throttle_ms() -> u64 {
    1000
}
fn default_unknown_device_name() -> String {
    UNKNOWN_DEVICE_NAME.to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub ble: BleSettings,
    /// Platform the simulated adapter pretends to be
    #[serde(default)]
    pub platform: Platform,
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

    /// Load from an explicit file, falling back to defaults when it is missing or invalid
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Using default settings ({}): {}", settings_path.display(), e);
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
        path.push("BleWorkflow");
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

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn set_adapter_name(&mut self, name: &str) -> anyhow::Result<()> {
        self.settings.ble.adapter_name = Some(name.to_string());
        self.save()
    }
}
