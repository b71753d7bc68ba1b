use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TaskdError;

/// Default location of the externally managed reset config.
pub const DEFAULT_RESET_CONFIG_PATH: &str = "/user/restore/reset/config/reset.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub job_id: String,
    pub tick_interval_ms: u64,
    /// Restart budget handed to the pod-rescheduling plugin.
    pub max_restart_times: i64,
    pub reset_config_path: PathBuf,
    /// How long pod rescheduling waits for exited agents when the command
    /// carries no `Timeout`.
    pub stop_wait_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            job_id: String::new(),
            tick_interval_ms: 1000,
            max_restart_times: 3,
            reset_config_path: PathBuf::from(DEFAULT_RESET_CONFIG_PATH),
            stop_wait_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub inbound_capacity: usize,
    pub processor_workers: usize,
    pub outbound_capacity: usize,
    /// Upper bound on concurrent network sends issued by the dispatcher.
    pub max_inflight_sends: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 1000,
            processor_workers: 4,
            outbound_capacity: 1000,
            max_inflight_sends: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_addr: SocketAddr,
    pub send_timeout_ms: u64,
    /// Longest inbound line accepted by the receiver.
    pub max_frame_bytes: usize,
    pub default_route: Option<SocketAddr>,
    /// Receiver identity -> address, e.g. `Controller = "127.0.0.1:9602"`.
    pub routes: HashMap<String, SocketAddr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9601)),
            send_timeout_ms: 3000,
            max_frame_bytes: 1024 * 1024,
            default_route: None,
            routes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: log_dir(),
            filter: "taskd=info,taskd_manager=info,taskd_core=info".to_string(),
        }
    }
}

/// Top-level configuration aggregating all sub-configs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskdConfig {
    #[serde(default)]
    pub manager: ManagerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TaskdConfig {
    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<(), TaskdError> {
        if self.queue.inbound_capacity == 0 || self.queue.outbound_capacity == 0 {
            return Err(TaskdError::Config("queue capacities must be non-zero".into()));
        }
        if self.queue.processor_workers == 0 {
            return Err(TaskdError::Config("processor_workers must be at least 1".into()));
        }
        if self.queue.max_inflight_sends == 0 {
            return Err(TaskdError::Config("max_inflight_sends must be at least 1".into()));
        }
        if self.network.max_frame_bytes == 0 {
            return Err(TaskdError::Config("max_frame_bytes must be non-zero".into()));
        }
        if self.manager.tick_interval_ms == 0 {
            return Err(TaskdError::Config("tick_interval_ms must be non-zero".into()));
        }
        Ok(())
    }
}

/// Returns the config directory for taskd.
///
/// `$XDG_CONFIG_HOME/taskd` when set, otherwise `~/.config/taskd`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("taskd");
    }
    if let Some(home) = home_dir() {
        return home.join(".config").join("taskd");
    }
    PathBuf::from(".taskd")
}

/// Returns the full path to the default config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Returns `~/.taskd/logs/`.
pub fn log_dir() -> PathBuf {
    match home_dir() {
        Some(home) => home.join(".taskd").join("logs"),
        None => PathBuf::from(".taskd").join("logs"),
    }
}

/// Load configuration from a TOML file.
/// Falls back to defaults if the file doesn't exist or can't be parsed.
pub fn load_config(path: &Path) -> TaskdConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("Failed to parse config {:?}: {}, using defaults", path, e);
                TaskdConfig::default()
            }
        },
        Err(_) => {
            tracing::debug!("Config file {:?} not found, using defaults", path);
            TaskdConfig::default()
        }
    }
}

/// Save configuration to a TOML file.
/// Creates parent directories if they don't exist.
pub fn save_config(config: &TaskdConfig, path: &Path) -> Result<(), TaskdError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents =
        toml::to_string_pretty(config).map_err(|e| TaskdError::Config(e.to_string()))?;
    std::fs::write(path, contents)?;
    tracing::info!("Config saved to {:?}", path);
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml"));
        assert_eq!(config.manager.tick_interval_ms, 1000);
        assert_eq!(config.queue.processor_workers, 4);
        assert_eq!(config.manager.stop_wait_ms, 300_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_section_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskd.toml");
        std::fs::write(
            &path,
            "[queue]\nprocessor_workers = 8\n\n[network.routes]\nController = \"127.0.0.1:9602\"\n",
        )
        .unwrap();

        let config = load_config(&path);
        assert_eq!(config.queue.processor_workers, 8);
        assert_eq!(config.queue.inbound_capacity, 1000);
        assert_eq!(
            config.network.routes.get("Controller"),
            Some(&"127.0.0.1:9602".parse().unwrap())
        );
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("taskd.toml");
        let mut config = TaskdConfig::default();
        config.manager.job_id = "job-42".into();
        save_config(&config, &path).unwrap();

        assert_eq!(load_config(&path).manager.job_id, "job-42");
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = TaskdConfig::default();
        config.queue.processor_workers = 0;
        assert!(matches!(config.validate(), Err(TaskdError::Config(_))));
    }
}
