//! Ambient configuration: a TOML file loaded once at startup and kept live
//! behind a `notify` file watcher, the same shape this workspace's agent
//! uses for its own `config.toml`.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Full application configuration, loaded from TOML.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub transport: TransportConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// `[transport]`: where and how to reach the shared-memory region.
#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    /// Path to the shared-memory file or `/dev/kvmfr*` device.
    pub shm_path: String,
    /// Prefer DMA-buf delivery over a byte copy when the sink supports it.
    #[serde(default = "default_true")]
    pub prefer_dmabuf: bool,
}

fn default_true() -> bool {
    true
}

/// `[polling]`: intervals the watchdog and queue-poll loops sleep for
/// between samples. The spec leaves exact numbers unspecified beyond
/// "bounded and frequent"; these are the defaults the driver falls back to.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    pub session_retry_ms: u64,
    pub queue_empty_sleep_ms: u64,
    pub heartbeat_check_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            session_retry_ms: 250,
            queue_empty_sleep_ms: 4,
            heartbeat_check_ms: 100,
        }
    }
}

/// `[metrics]`: optional Prometheus exporter bind address.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_address: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let cfg: Config = toml::from_str(&s)?;

        if cfg.transport.shm_path.is_empty() {
            return Err(ConfigError::Validation("transport.shm_path must not be empty".into()));
        }

        Ok(cfg)
    }

    #[cfg(test)]
    pub fn from_str(toml: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml)?)
    }
}

/// Manages a live-updating `Config` via file-watcher, same shape as this
/// workspace's existing `ConfigManager`.
pub struct ConfigManager {
    inner: Arc<RwLock<Config>>,
    _watcher: RecommendedWatcher,
}

impl ConfigManager {
    pub fn new(path: &Path) -> Result<Self, ConfigError> {
        let cfg = Config::load(path)?;
        let shared = Arc::new(RwLock::new(cfg));
        let (tx, rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(tx, notify::Config::default().with_poll_interval(Duration::from_secs(1)))
            .map_err(|e| ConfigError::Validation(format!("watcher error: {e}")))?;

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| ConfigError::Validation(format!("watch error: {e}")))?;

        let cfg_path = path.to_path_buf();
        let shared_clone = Arc::clone(&shared);
        thread::Builder::new()
            .name("config_watcher".into())
            .spawn(move || {
                for evt in rx {
                    let Ok(event) = evt else { continue };
                    if let EventKind::Modify(_) = event.kind {
                        match Config::load(&cfg_path) {
                            Ok(new_cfg) => {
                                *shared_clone.write().unwrap() = new_cfg;
                                log::info!("config reloaded");
                            }
                            Err(e) => log::error!("failed to reload config: {e}"),
                        }
                    }
                }
            })
            .map_err(|e| ConfigError::Validation(format!("failed to spawn config watcher: {e}")))?;

        Ok(Self { inner: shared, _watcher: watcher })
    }

    /// Snapshot-like read of the current config.
    pub fn get(&self) -> Config {
        self.inner.read().unwrap().clone()
    }
}
