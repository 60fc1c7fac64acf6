use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use blocksync_core::position::{DEFAULT_POSITION_STEP, PositionStrategy};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path:?}")]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    ParseConfig {
        path: Option<PathBuf>,
        source: toml::de::Error,
    },
    #[error("{message}")]
    Validation { message: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub request_timeout_ms: u64,
    /// Database file for the offline queue. `None` keeps it in memory.
    pub log_path: Option<PathBuf>,
    pub replay: Replay,
    pub positions: Positions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Replay {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Positions {
    pub strategy: PositionStrategy,
    pub step: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            log_path: None,
            replay: Replay::default(),
            positions: Positions::default(),
        }
    }
}

impl Default for Replay {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

impl Default for Positions {
    fn default() -> Self {
        Self {
            strategy: PositionStrategy::Monotonic,
            step: DEFAULT_POSITION_STEP,
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Replay {
    /// Delay before the attempt following `failed_attempts` failures.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let shift = failed_attempts.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(1 << shift))
    }
}

pub fn load(path: &Path) -> Result<SyncConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|err| ConfigError::ReadConfig {
        path: path.to_path_buf(),
        source: err,
    })?;

    let cfg: SyncConfig = toml::from_str(&raw).map_err(|err| ConfigError::ParseConfig {
        path: Some(path.to_path_buf()),
        source: err,
    })?;

    validate(&cfg)?;

    Ok(cfg)
}

pub fn parse(raw: &str) -> Result<SyncConfig, ConfigError> {
    let cfg: SyncConfig =
        toml::from_str(raw).map_err(|err| ConfigError::ParseConfig { path: None, source: err })?;

    validate(&cfg)?;

    Ok(cfg)
}

pub fn validate(cfg: &SyncConfig) -> Result<(), ConfigError> {
    if cfg.request_timeout_ms == 0 {
        return Err(ConfigError::Validation {
            message: "request_timeout_ms must be greater than zero.".to_string(),
        });
    }
    if cfg.replay.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "replay.max_attempts must be greater than zero.".to_string(),
        });
    }
    if !cfg.positions.step.is_finite() || cfg.positions.step <= 0.0 {
        return Err(ConfigError::Validation {
            message: "positions.step must be a finite number greater than zero.".to_string(),
        });
    }

    Ok(())
}
