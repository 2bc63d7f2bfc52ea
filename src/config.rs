use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Global configuration instance.
static CONFIG: RwLock<Option<Config>> = RwLock::new(None);

/// Run manager configuration: timeouts, concurrency caps, and paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Run loop defaults and bounds.
    pub run: RunConfig,

    /// Sandbox/git behavior.
    pub sandbox: SandboxConfig,

    /// Child process supervision.
    pub child: ChildConfig,

    /// Metrics server configuration.
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Default `max_iterations` when `start` omits it.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u64,

    /// Default inactivity timeout in seconds.
    #[serde(default = "default_inactivity_timeout")]
    pub default_inactivity_timeout_secs: u64,

    /// Default iteration wall-clock timeout in seconds.
    #[serde(default = "default_iteration_timeout")]
    pub default_iteration_timeout_secs: u64,

    /// Root directory under which worktrees are materialized.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Git committer identity used for non-interactive canonical merges.
    #[serde(default = "default_merge_author_name")]
    pub merge_author_name: String,
    #[serde(default = "default_merge_author_email")]
    pub merge_author_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildConfig {
    /// Interval at which the inactivity watcher polls `last-run.log`.
    #[serde(default = "default_inactivity_poll_ms")]
    pub inactivity_poll_ms: u64,

    /// Grace window between SIGTERM and SIGKILL escalation.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_max_iterations() -> u64 {
    10
}
fn default_inactivity_timeout() -> u64 {
    600
}
fn default_iteration_timeout() -> u64 {
    3600
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(env::var("JEEVES_DATA_DIR").unwrap_or_else(|_| "/var/lib/jeeves".to_string()))
}
fn default_merge_author_name() -> String {
    "jeeves-bot".to_string()
}
fn default_merge_author_email() -> String {
    "jeeves-bot@localhost".to_string()
}
fn default_inactivity_poll_ms() -> u64 {
    150
}
fn default_kill_grace_secs() -> u64 {
    2
}
fn default_metrics_port() -> u16 {
    9191
}
fn default_true() -> bool {
    true
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
            default_inactivity_timeout_secs: default_inactivity_timeout(),
            default_iteration_timeout_secs: default_iteration_timeout(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            merge_author_name: default_merge_author_name(),
            merge_author_email: default_merge_author_email(),
        }
    }
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            inactivity_poll_ms: default_inactivity_poll_ms(),
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
            enabled: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            run: RunConfig::default(),
            sandbox: SandboxConfig::default(),
            child: ChildConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file named by `JEEVES_CONFIG_PATH`, or
    /// from defaults overridden by environment variables.
    pub fn load() -> CoreResult<Self> {
        if let Ok(path) = env::var("JEEVES_CONFIG_PATH") {
            Self::from_file(&path)
        } else if Path::new("config/jeeves.yaml").exists() {
            Self::from_file("config/jeeves.yaml")
        } else {
            Ok(Self::from_env(Self::default()))
        }
    }

    pub fn from_file(path: &str) -> CoreResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| CoreError::Other(anyhow::anyhow!("failed to parse config {path}: {e}")))?;
        Ok(Self::from_env(config))
    }

    /// Apply `JEEVES_*` environment overrides on top of a base config.
    pub fn from_env(mut config: Config) -> Self {
        if let Ok(v) = env::var("JEEVES_DATA_DIR") {
            config.run.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("JEEVES_DEFAULT_MAX_ITERATIONS") {
            if let Ok(n) = v.parse() {
                config.run.default_max_iterations = n;
            }
        }
        if let Ok(v) = env::var("JEEVES_INACTIVITY_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                config.run.default_inactivity_timeout_secs = n;
            }
        }
        if let Ok(v) = env::var("JEEVES_ITERATION_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                config.run.default_iteration_timeout_secs = n;
            }
        }
        if let Ok(v) = env::var("JEEVES_METRICS_PORT") {
            if let Ok(n) = v.parse() {
                config.metrics.port = n;
            }
        }
        config
    }

    /// Get the global configuration instance, initializing it on first use.
    pub fn global() -> CoreResult<Config> {
        let guard = CONFIG
            .read()
            .map_err(|e| CoreError::Other(anyhow::anyhow!("config lock poisoned: {e}")))?;
        if let Some(ref config) = *guard {
            Ok(config.clone())
        } else {
            drop(guard);
            Self::initialize()
        }
    }

    pub fn initialize() -> CoreResult<Config> {
        let config = Self::load()?;
        let mut guard = CONFIG
            .write()
            .map_err(|e| CoreError::Other(anyhow::anyhow!("config lock poisoned: {e}")))?;
        *guard = Some(config.clone());
        Ok(config)
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.run.default_inactivity_timeout_secs)
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.run.default_iteration_timeout_secs)
    }
}
