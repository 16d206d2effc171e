//! Configuration
//!
//! Layered with figment, later layers win:
//! 1. built-in defaults
//! 2. `appose.toml` (path overridable)
//! 3. `APPOSE_*` environment variables, `__` separating nested keys
//!    (`APPOSE_SERVICE__SHUTDOWN_GRACE_MS=2000`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::environment::RestartPolicy;
use crate::protocol::DEFAULT_MAX_FRAME_LEN;
use crate::service::{ServiceConfig, WorkerCommand};

pub const CONFIG_FILE: &str = "appose.toml";
pub const ENV_PREFIX: &str = "APPOSE_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] figment::Error),

    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApposeConfig {
    pub environments: EnvironmentsConfig,
    pub worker: WorkerConfig,
    pub service: ServiceSettings,
    pub restart: RestartSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentsConfig {
    /// Provisioned environments live in `<root_dir>/<id>`
    pub root_dir: PathBuf,
}

impl Default for EnvironmentsConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            root_dir: base.join("appose").join("envs"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker binary; `appose-worker` is located when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub shutdown_grace_ms: u64,
    pub cancel_grace_ms: u64,
    pub max_frame_len: usize,
    pub forward_stderr: bool,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: 5_000,
            cancel_grace_ms: 10_000,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            forward_stderr: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSettings {
    pub max_restarts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub window_secs: u64,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            window_secs: 300,
        }
    }
}

impl ApposeConfig {
    /// Load from `appose.toml` in the working directory and the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(CONFIG_FILE)
    }

    /// Load from an explicit file; a missing file is not an error
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(Self::figment(path).extract()?)
    }

    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig::default()
            .with_shutdown_grace(Duration::from_millis(self.service.shutdown_grace_ms))
            .with_cancel_grace(Duration::from_millis(self.service.cancel_grace_ms))
            .with_max_frame_len(self.service.max_frame_len)
            .forward_stderr(self.service.forward_stderr)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.restart.max_restarts,
            initial_backoff: Duration::from_millis(self.restart.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.restart.max_backoff_ms),
            multiplier: self.restart.multiplier,
            window: Duration::from_secs(self.restart.window_secs),
        }
    }

    pub fn worker_command(&self) -> WorkerCommand {
        let command = match &self.worker.program {
            Some(program) => WorkerCommand::new(program),
            None => WorkerCommand::locate_default(),
        };
        command.with_args(self.worker.args.iter().cloned())
    }

    /// The effective configuration as `appose.toml` text
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
