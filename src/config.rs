use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::events::DEFAULT_CAPACITY;
use crate::orchestration::{
    DEFAULT_CONCURRENCY, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_TICK_INTERVAL_MS,
};
use crate::{Error, Result};

/// Default per-task timeout applied to plan tasks that set none.
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 600_000;

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TASK_TIMEOUT_MS
}

fn default_event_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub auto_remediate: bool,
    pub sessions_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            default_timeout_ms: default_timeout_ms(),
            event_capacity: default_event_capacity(),
            tick_interval_ms: default_tick_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            auto_remediate: false,
            sessions_dir: None,
        }
    }
}

impl Config {
    pub fn provisor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".provisor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::provisor_dir()?.join("provisor.toml"))
    }

    /// Directory holding persisted session records.
    pub fn sessions_dir(&self) -> Result<PathBuf> {
        match &self.sessions_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::provisor_dir()?.join("sessions")),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        tracing::debug!("Config::load path={}", path.display());
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        tracing::debug!(
            "Config loaded: concurrency={}, default_timeout_ms={}, auto_remediate={}, sessions_dir={:?}",
            config.concurrency,
            config.default_timeout_ms,
            config.auto_remediate,
            config.sessions_dir
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::provisor_dir()?;
        tracing::debug!("Config::save dir={}", dir.display());
        if !dir.exists() {
            tracing::debug!("Creating provisor directory");
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        tracing::debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Reject values the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Validation("concurrency must be at least 1".into()));
        }
        if self.default_timeout_ms == 0 {
            return Err(Error::Validation(
                "default_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
