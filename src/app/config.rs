use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::app::error::AppError;
use crate::app::models::ExecutionMode;

pub const DEFAULT_HELPER_SOCKET: &str = "/data/local/tmp/appcontrol-helper.sock";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutionSettings {
    pub preferred_mode: Option<ExecutionMode>,
    pub su_program: String,
    pub session_timeout_secs: u64,
    pub root_probe_timeout_secs: u64,
    pub helper_socket_path: String,
    pub helper_token: Option<String>,
    pub helper_connect_timeout_ms: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            preferred_mode: None,
            su_program: "su".to_string(),
            session_timeout_secs: 30,
            root_probe_timeout_secs: 10,
            helper_socket_path: DEFAULT_HELPER_SOCKET.to_string(),
            helper_token: None,
            helper_connect_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InventorySettings {
    pub cache_ttl_secs: u64,
    pub detect_running: bool,
}

impl Default for InventorySettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            detect_running: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorSettings {
    pub default_interval_ms: u64,
    pub realtime_interval_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            default_interval_ms: 2000,
            realtime_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PolicySettings {
    pub extra_allowed_prefixes: Vec<String>,
    pub extra_blocked_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistorySettings {
    pub max_entries: usize,
    pub db_path: String,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            max_entries: 100,
            db_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub inventory: InventorySettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub policy: PolicySettings,
    #[serde(default)]
    pub history: HistorySettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            execution: ExecutionSettings::default(),
            inventory: InventorySettings::default(),
            monitor: MonitorSettings::default(),
            policy: PolicySettings::default(),
            history: HistorySettings::default(),
            logging: LoggingSettings::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl AppConfig {
    pub fn history_db_path(&self) -> PathBuf {
        if !self.history.db_path.trim().is_empty() {
            return PathBuf::from(self.history.db_path.trim());
        }
        let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        base.join("appcontrol").join("action_logs.db")
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("APPCONTROL_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".appcontrol_config.json")
}

pub fn backup_config_path(path: &Path) -> PathBuf {
    path.with_extension("backup.json")
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from_path(&config_path())
}

pub fn load_config_from_path(path: &Path) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse config: {err}"), ""))?;
    let mut config: AppConfig = serde_json::from_value(value.clone()).unwrap_or_default();
    config = apply_legacy_overrides(config, &value);
    Ok(validate_config(config))
}

pub fn save_config_to_path(
    config: &AppConfig,
    path: &Path,
    backup_path: &Path,
) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    if path.exists() {
        let _ = fs::copy(path, backup_path);
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| AppError::system(format!("Failed to serialize config: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write config: {err}"), ""))?;
    Ok(())
}

// Older builds stored the mode as a flat lowercase preference string.
fn apply_legacy_overrides(mut config: AppConfig, value: &serde_json::Value) -> AppConfig {
    if let Some(mode) = value.get("execution_mode").and_then(|v| v.as_str()) {
        config.execution.preferred_mode = match mode.trim().to_lowercase().as_str() {
            "root" => Some(ExecutionMode::Root),
            "shizuku" => Some(ExecutionMode::Helper),
            "none" => Some(ExecutionMode::None),
            _ => config.execution.preferred_mode,
        };
    }
    if let Some(ttl) = value.get("cache_ttl_secs").and_then(|v| v.as_u64()) {
        config.inventory.cache_ttl_secs = ttl;
    }
    config
}

fn validate_config(mut config: AppConfig) -> AppConfig {
    let defaults = AppConfig::default();
    if config.execution.su_program.trim().is_empty() {
        config.execution.su_program = defaults.execution.su_program.clone();
    }
    if !(1..=600).contains(&config.execution.session_timeout_secs) {
        config.execution.session_timeout_secs = defaults.execution.session_timeout_secs;
    }
    if !(1..=120).contains(&config.execution.root_probe_timeout_secs) {
        config.execution.root_probe_timeout_secs = defaults.execution.root_probe_timeout_secs;
    }
    if config.execution.helper_socket_path.trim().is_empty() {
        config.execution.helper_socket_path = defaults.execution.helper_socket_path.clone();
    }
    if !(100..=60_000).contains(&config.execution.helper_connect_timeout_ms) {
        config.execution.helper_connect_timeout_ms =
            defaults.execution.helper_connect_timeout_ms;
    }
    if config.inventory.cache_ttl_secs > 3600 {
        config.inventory.cache_ttl_secs = defaults.inventory.cache_ttl_secs;
    }
    if !(500..=10_000).contains(&config.monitor.default_interval_ms) {
        config.monitor.default_interval_ms = defaults.monitor.default_interval_ms;
    }
    if !(500..=10_000).contains(&config.monitor.realtime_interval_ms) {
        config.monitor.realtime_interval_ms = defaults.monitor.realtime_interval_ms;
    }
    if config.history.max_entries == 0 {
        config.history.max_entries = defaults.history.max_entries;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_legacy_values() {
        let value = serde_json::json!({
            "execution_mode": "shizuku",
            "cache_ttl_secs": 5,
            "unknown_key": true
        });
        let mut config: AppConfig = serde_json::from_value(value.clone()).unwrap_or_default();
        config = apply_legacy_overrides(config, &value);
        assert_eq!(config.execution.preferred_mode, Some(ExecutionMode::Helper));
        assert_eq!(config.inventory.cache_ttl_secs, 5);
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = AppConfig::default();
        config.execution.session_timeout_secs = 0;
        config.execution.helper_connect_timeout_ms = 5;
        config.execution.su_program = "  ".to_string();
        config.monitor.default_interval_ms = 10;
        config.monitor.realtime_interval_ms = 99_999;
        config.history.max_entries = 0;
        let validated = validate_config(config);
        assert_eq!(validated.execution.session_timeout_secs, 30);
        assert_eq!(validated.execution.helper_connect_timeout_ms, 3000);
        assert_eq!(validated.execution.su_program, "su");
        assert_eq!(validated.monitor.default_interval_ms, 2000);
        assert_eq!(validated.monitor.realtime_interval_ms, 1000);
        assert_eq!(validated.history.max_entries, 100);
    }

    #[test]
    fn save_then_load_keeps_preferred_mode_and_writes_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let backup = backup_config_path(&path);

        let mut config = AppConfig::default();
        config.execution.preferred_mode = Some(ExecutionMode::Root);
        save_config_to_path(&config, &path, &backup).expect("first save");
        config.execution.preferred_mode = Some(ExecutionMode::None);
        save_config_to_path(&config, &path, &backup).expect("second save");

        let loaded = load_config_from_path(&path).expect("load");
        assert_eq!(loaded.execution.preferred_mode, Some(ExecutionMode::None));
        let previous = load_config_from_path(&backup).expect("load backup");
        assert_eq!(previous.execution.preferred_mode, Some(ExecutionMode::Root));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = load_config_from_path(&dir.path().join("absent.json")).expect("load");
        assert_eq!(loaded, AppConfig::default());
    }
}
