use crate::infrastructure::bluetooth::protocol;
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
    "warn".to_string()
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
    "quickdraw_duel".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_name_prefix")]
    pub device_name_prefix: String,
    /// 0 scans until a device shows up or the user gives up
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,

    // Results
    /// Defaults to `duel_results.jsonl` next to the settings file
    #[serde(default)]
    pub results_path: Option<String>,
    #[serde(default = "default_leaderboard_limit")]
    pub leaderboard_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            device_name_prefix: default_name_prefix(),
            scan_timeout_secs: default_scan_timeout_secs(),
            results_path: None,
            leaderboard_limit: default_leaderboard_limit(),
        }
    }
}

impl Settings {
    pub fn scan_timeout(&self) -> Option<Duration> {
        (self.scan_timeout_secs > 0).then(|| Duration::from_secs(self.scan_timeout_secs))
    }
}

fn default_service_uuid() -> String {
    protocol::UART_SERVICE_UUID.to_string()
}
fn default_name_prefix() -> String {
    protocol::DEFAULT_NAME_PREFIX.to_string()
}
fn default_scan_timeout_secs() -> u64 {
    20
}
fn default_leaderboard_limit() -> usize {
    10
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory, falling back to defaults.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults.
    pub fn from_path(settings_path: PathBuf) -> Self {
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
        path.push("QuickdrawDuel");
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

    pub fn exists(&self) -> bool {
        self.settings_path.exists()
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

    pub fn results_path(&self) -> PathBuf {
        match &self.settings.results_path {
            Some(path) => PathBuf::from(path),
            None => self.settings_path.with_file_name("duel_results.jsonl"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: Settings = serde_json::from_str(r#"{ "leaderboard_limit": 3 }"#).unwrap();
        assert_eq!(settings.leaderboard_limit, 3);
        assert_eq!(
            settings.ble_service_uuid,
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(settings.device_name_prefix, "BBC micro:bit");
        assert_eq!(settings.scan_timeout(), Some(Duration::from_secs(20)));
        assert_eq!(settings.log_settings.level, "warn");
    }

    #[test]
    fn test_zero_scan_timeout_disables_it() {
        let settings = Settings {
            scan_timeout_secs: 0,
            ..Settings::default()
        };
        assert_eq!(settings.scan_timeout(), None);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::from_path(path.clone());
        assert!(!service.exists());
        service.get_mut().device_name_prefix = "Sensor".to_string();
        service.save().unwrap();

        let reloaded = SettingsService::from_path(path);
        assert!(reloaded.exists());
        assert_eq!(reloaded.get().device_name_prefix, "Sensor");
        assert_eq!(
            reloaded.results_path(),
            dir.path().join("nested").join("duel_results.jsonl")
        );
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let service = SettingsService::from_path(path);
        assert_eq!(service.get().leaderboard_limit, 10);
    }
}
