use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Top-level configuration loaded from foreman.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default, Clone)]
pub struct ForemanConfig {
    pub data: DataConfig,
    pub workers: WorkersConfig,
    pub review: ReviewConfig,
    pub lock: LockConfig,
    pub retry: RetryConfig,
}

impl ForemanConfig {
    /// Load configuration from a TOML file. If the file doesn't exist,
    /// returns compiled defaults. Returns an error only if the file exists
    /// but can't be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let config: ForemanConfig =
                    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Apply CLI overrides to this config. CLI values take precedence
    /// over file/default values when present (Some).
    pub fn apply_cli_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(ref d) = overrides.data_dir {
            self.data.dir = d.clone();
        }
        if let Some(w) = overrides.workers {
            self.workers.count = w;
        }
    }

    /// Reject configurations that cannot drive a session.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers.count == 0 {
            return Err(ConfigError::Invalid {
                detail: "workers.count must be at least 1".to_string(),
            });
        }
        if self.review.reviewer.is_empty() {
            return Err(ConfigError::Invalid {
                detail: "review.reviewer must not be empty".to_string(),
            });
        }
        if self.lock.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                detail: "lock.timeout_secs must be at least 1".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                detail: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock.timeout_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }
}

/// CLI values that can override config file settings.
/// All fields are Option so only explicitly-provided flags apply.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub data_dir: Option<PathBuf>,
    pub workers: Option<u32>,
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        detail: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(
                    f,
                    "failed to read config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::Parse { path, source } => {
                write!(
                    f,
                    "failed to parse config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::Invalid { detail } => write!(f, "invalid configuration: {detail}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DataConfig {
    /// Root of the data directory holding the integration workspace,
    /// worker workspaces, lock markers and the STOP file.
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkersConfig {
    pub count: u32,
    pub poll_interval_secs: u64,
    pub max_idle_polls: u32,
    pub max_resubmissions: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReviewConfig {
    pub reviewer: String,
    pub poll_interval_secs: u64,
    pub max_idle_polls: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LockConfig {
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

// --- Default implementations ---

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".foreman"),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 2,
            poll_interval_secs: 2,
            max_idle_polls: 3,
            max_resubmissions: 1,
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            reviewer: "reviewer-1".to_string(),
            poll_interval_secs: 5,
            max_idle_polls: 2,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            poll_interval_ms: 100,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}
