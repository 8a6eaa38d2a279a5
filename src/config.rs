use crate::sys::{self, Signal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_RELOAD_SIGNAL: &str = "SIGINT";
pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_READY_DELAY_MS: u64 = 500;
pub const MIN_ID_LEN: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid id '{id}': {reason}")]
    InvalidId { id: String, reason: &'static str },
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("instances must be a positive integer")]
    InvalidInstances,
    #[error("config id '{found}' does not match app id '{expected}'")]
    IdMismatch { expected: String, found: String },
    #[error(transparent)]
    InvalidSignal(#[from] sys::InvalidSignal),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a worker announces that it is ready to serve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyMode {
    /// Online once the process has stayed up for `readyDelayMs`.
    #[default]
    Spawn,
    /// Online when the worker reports `READY=1` or `LISTENING=` on the notify socket.
    Notify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub exec_path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_instances")]
    pub instances: usize,
    #[serde(default = "default_reload_signal")]
    pub reload_signal: String,
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout_ms: u64,
    #[serde(default)]
    pub ready_mode: ReadyMode,
    #[serde(default = "default_ready_delay")]
    pub ready_delay_ms: u64,
}

fn default_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_reload_signal() -> String {
    DEFAULT_RELOAD_SIGNAL.to_string()
}

fn default_kill_timeout() -> u64 {
    DEFAULT_KILL_TIMEOUT_MS
}

fn default_ready_delay() -> u64 {
    DEFAULT_READY_DELAY_MS
}

impl AppConfig {
    pub fn new(id: impl Into<String>, exec_path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            exec_path: exec_path.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            instances: default_instances(),
            reload_signal: default_reload_signal(),
            kill_timeout_ms: DEFAULT_KILL_TIMEOUT_MS,
            ready_mode: ReadyMode::default(),
            ready_delay_ms: DEFAULT_READY_DELAY_MS,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::MissingField("id"));
        }
        if self.exec_path.is_empty() {
            return Err(ConfigError::MissingField("execPath"));
        }
        validate_id(&self.id)?;
        if self.instances == 0 {
            return Err(ConfigError::InvalidInstances);
        }
        self.reload_signal()?;
        Ok(())
    }

    pub fn reload_signal(&self) -> Result<Signal, sys::InvalidSignal> {
        sys::parse_signal(&self.reload_signal)
    }
}

pub fn validate_id(id: &str) -> Result<(), ConfigError> {
    if id.contains('/') || id.contains('\\') {
        return Err(ConfigError::InvalidId {
            id: id.to_string(),
            reason: "path separators are not allowed",
        });
    }
    if id.chars().count() < MIN_ID_LEN {
        return Err(ConfigError::InvalidId {
            id: id.to_string(),
            reason: "must be at least 3 characters long",
        });
    }
    Ok(())
}

/// Loads `config.json` and checks that it belongs to `id`.
pub fn load_config(path: &Path, id: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let config: AppConfig = serde_json::from_str(&contents)?;
    if config.id != id {
        return Err(ConfigError::IdMismatch {
            expected: id.to_string(),
            found: config.id,
        });
    }
    Ok(config)
}

pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    let json = serde_json::to_vec_pretty(config)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_id_accepts_plain_names() {
        assert!(validate_id("web").is_ok());
        assert!(validate_id("api-server.v2").is_ok());
    }

    #[test]
    fn test_validate_id_rejects_short() {
        let err = validate_id("ab").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidId { .. }));
        assert!(err.to_string().contains("at least 3"));
    }

    #[test]
    fn test_validate_id_rejects_separators() {
        assert!(validate_id("a/bc").is_err());
        assert!(validate_id("a\\bc").is_err());
        assert!(validate_id("../etc").is_err());
    }

    #[test]
    fn test_validate_requires_id_and_exec_path() {
        let config = AppConfig::new("", "/srv/web/app");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("id"))
        ));

        let config = AppConfig::new("web", "");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("execPath"))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_instances() {
        let mut config = AppConfig::new("web", "/srv/web/app");
        config.instances = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidInstances)
        ));
    }

    #[test]
    fn test_validate_rejects_bad_reload_signal() {
        let mut config = AppConfig::new("web", "/srv/web/app");
        config.reload_signal = "SIGNOPE".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSignal(_))
        ));
    }

    #[test]
    fn test_minimal_json_fills_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"id":"web","execPath":"/srv/web/app","instances":2}"#)
                .unwrap();
        assert_eq!(config.instances, 2);
        assert!(config.args.is_empty());
        assert!(config.env.is_empty());
        assert_eq!(config.reload_signal, "SIGINT");
        assert_eq!(config.kill_timeout_ms, DEFAULT_KILL_TIMEOUT_MS);
        assert_eq!(config.ready_mode, ReadyMode::Spawn);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_instances_defaults_to_cpus() {
        let config: AppConfig =
            serde_json::from_str(r#"{"id":"web","execPath":"/srv/web/app"}"#).unwrap();
        assert!(config.instances >= 1);
    }

    #[test]
    fn test_serializes_camel_case() {
        let mut config = AppConfig::new("web", "/srv/web/app");
        config.ready_mode = ReadyMode::Notify;
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["execPath"], "/srv/web/app");
        assert_eq!(value["readyMode"], "notify");
        assert!(value.get("cwd").is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::new("web", "/srv/web/app");
        config.env.insert("PORT".to_string(), "3000".to_string());

        save_config(&path, &config).unwrap();
        assert_eq!(load_config(&path, "web").unwrap(), config);
    }

    #[test]
    fn test_load_rejects_mismatched_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        save_config(&path, &AppConfig::new("api", "/srv/api")).unwrap();

        let err = load_config(&path, "web").unwrap_err();
        assert!(matches!(err, ConfigError::IdMismatch { .. }));
    }
}
