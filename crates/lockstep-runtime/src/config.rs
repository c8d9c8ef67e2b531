//! Runtime configuration.
//!
//! Defaults, then an optional JSON file named by `LOCKSTEP_CONFIG`, then
//! individual `LOCKSTEP_*` variables, each layer overriding the last.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::DEFAULT_SOCKET_PATH;

/// Errors from loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which checkpoint engine the injected instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Every writable private mapping.
    Mappings,
    /// Save and load are answered with an engine failure.
    Disabled,
}

impl FromStr for EngineKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "mappings" => Ok(Self::Mappings),
            "disabled" | "none" => Ok(Self::Disabled),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Control socket the injected instance listens on.
    pub socket_path: PathBuf,
    /// Framerate numerator.
    pub fps_num: u32,
    /// Framerate denominator.
    pub fps_den: u32,
    /// Deterministic time at frame 0, in nanoseconds.
    pub initial_time_ns: u64,
    /// Seed for every random answer the runtime gives.
    pub seed: u64,
    /// Real-time slowdown factor applied to frame pacing.
    pub speed_divisor: u32,
    /// Skip real-time pacing entirely.
    pub fast_forward: bool,
    /// Clock reads within one frame on the presenting thread after which
    /// time is pushed forward by one frame (0 = never).
    pub time_query_threshold: u32,
    pub checkpoint_engine: EngineKind,
    /// Total bytes all slots may hold (0 = unlimited).
    pub checkpoint_budget: usize,
    /// Bytes the internal arena may map (0 = unlimited).
    pub arena_limit: usize,
    /// How long a thread may take to reach its suspend point.
    pub suspend_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            fps_num: 60,
            fps_den: 1,
            initial_time_ns: 1_000_000_000,
            seed: 0,
            speed_divisor: 1,
            fast_forward: false,
            time_query_threshold: 0,
            checkpoint_engine: EngineKind::Mappings,
            checkpoint_budget: 0,
            arena_limit: 0,
            suspend_timeout_ms: 2000,
        }
    }
}

impl RuntimeConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load using `var` to read environment variables.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match var("LOCKSTEP_CONFIG") {
            Some(path) if !path.is_empty() => Self::from_file(PathBuf::from(path))?,
            _ => Self::default(),
        };

        if let Some(v) = var("LOCKSTEP_SOCKET") {
            config.socket_path = PathBuf::from(v);
        }
        override_with(&var, "LOCKSTEP_FPS_NUM", &mut config.fps_num)?;
        override_with(&var, "LOCKSTEP_FPS_DEN", &mut config.fps_den)?;
        override_with(&var, "LOCKSTEP_INITIAL_TIME_NS", &mut config.initial_time_ns)?;
        override_with(&var, "LOCKSTEP_SEED", &mut config.seed)?;
        override_with(&var, "LOCKSTEP_SPEED_DIVISOR", &mut config.speed_divisor)?;
        override_with(&var, "LOCKSTEP_FAST_FORWARD", &mut config.fast_forward)?;
        override_with(&var, "LOCKSTEP_TIME_QUERY_THRESHOLD", &mut config.time_query_threshold)?;
        override_with(&var, "LOCKSTEP_CHECKPOINT_ENGINE", &mut config.checkpoint_engine)?;
        override_with(&var, "LOCKSTEP_CHECKPOINT_BUDGET", &mut config.checkpoint_budget)?;
        override_with(&var, "LOCKSTEP_ARENA_LIMIT", &mut config.arena_limit)?;
        override_with(&var, "LOCKSTEP_SUSPEND_TIMEOUT_MS", &mut config.suspend_timeout_ms)?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path, source })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fps_num == 0 || self.fps_den == 0 {
            return Err(ConfigError::Invalid(format!(
                "framerate {}/{} must have a non-zero numerator and denominator",
                self.fps_num, self.fps_den
            )));
        }
        if self.speed_divisor == 0 {
            return Err(ConfigError::Invalid("speed divisor must be at least 1".into()));
        }
        Ok(())
    }
}

fn override_with<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    let Some(value) = var(name) else {
        return Ok(());
    };
    *slot = value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { var: name, value })?;
    Ok(())
}
