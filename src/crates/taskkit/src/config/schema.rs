//! Execution configuration schema

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::env::{build_env_key, get_env, get_env_bool, get_env_parse};
use super::{ConfigBuilder, ConfigError};
use crate::parallel::{MapOptions, Mode};
use crate::retry::RetryPolicy;

/// Prefix used by the `taskkit` binary for environment overrides
pub const DEFAULT_ENV_PREFIX: &str = "TASKKIT_";

/// Defaults for parallel maps, timeouts and retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Worker pool flavour
    pub mode: Mode,

    /// Pool size
    pub num_workers: usize,

    /// Draw a progress bar when the input length is known
    pub show_progress: bool,

    /// Default per-call timeout in seconds
    pub timeout_secs: Option<f64>,

    /// Default retry policy
    pub retry: RetrySettings,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Thread,
            num_workers: 8,
            show_progress: true,
            timeout_secs: None,
            retry: RetrySettings::default(),
        }
    }
}

/// Serializable form of a [`RetryPolicy`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub initial_delay_secs: f64,
    pub backoff_factor: f64,
    pub max_delay_secs: Option<f64>,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_secs: 1.0,
            backoff_factor: 1.0,
            max_delay_secs: None,
            jitter: false,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::new(self.max_attempts)
            .with_initial_delay(self.initial_delay_secs)
            .with_backoff_factor(self.backoff_factor)
            .with_jitter(self.jitter);
        match self.max_delay_secs {
            Some(max) => policy.with_max_delay(max),
            None => policy,
        }
    }
}

impl ExecutionConfig {
    /// Load a YAML (`.yaml`/`.yml`) or JSON (`.json`) file
    ///
    /// Missing fields take their defaults. The result is not validated.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let parse_error = |message: String| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        };

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).map_err(|e| parse_error(e.to_string()))?
            }
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| parse_error(e.to_string()))?
            }
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };

        debug!(path = %path.display(), "Loaded execution config");
        Ok(config)
    }

    /// Defaults, then `path` if given, then environment overrides; validated
    pub fn load(path: Option<&Path>, prefix: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = path {
            config.merge(Self::load_file(path)?);
        }
        config.apply_env(prefix)?;
        config.validate()?;
        Ok(config)
    }

    /// The configured retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.to_policy()
    }

    /// The configured default timeout
    ///
    /// `None` when unset or not representable; `validate` rejects the latter.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// Parallel-map options carrying the configured mode, pool size and
    /// progress flag
    pub fn map_options(&self) -> MapOptions {
        MapOptions::new()
            .with_mode(self.mode)
            .with_num_workers(self.num_workers)
            .with_progress(self.show_progress)
    }
}

impl ConfigBuilder for ExecutionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::invalid("num_workers", "must be at least 1"));
        }
        if let Some(secs) = self.timeout_secs {
            if secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                return Err(ConfigError::invalid(
                    "timeout_secs",
                    "must be a finite number of seconds greater than zero",
                ));
            }
        }
        self.retry_policy().validate()
    }

    fn apply_env(&mut self, prefix: &str) -> Result<(), ConfigError> {
        let key = |name: &str| build_env_key(prefix, name);

        if let Some(mode) = get_env_parse(&key("mode"))? {
            self.mode = mode;
        }
        if let Some(workers) = get_env_parse(&key("num_workers"))? {
            self.num_workers = workers;
        }
        if let Some(show) = get_env_bool(&key("show_progress"))? {
            self.show_progress = show;
        }
        if let Some(raw) = get_env(&key("timeout_secs"))? {
            // Empty or "none" clears the default timeout
            self.timeout_secs = match raw.trim() {
                "" | "none" => None,
                _ => get_env_parse(&key("timeout_secs"))?,
            };
        }
        if let Some(attempts) = get_env_parse(&key("retry_max_attempts"))? {
            self.retry.max_attempts = attempts;
        }
        if let Some(delay) = get_env_parse(&key("retry_initial_delay_secs"))? {
            self.retry.initial_delay_secs = delay;
        }
        if let Some(factor) = get_env_parse(&key("retry_backoff_factor"))? {
            self.retry.backoff_factor = factor;
        }
        if let Some(max) = get_env_parse(&key("retry_max_delay_secs"))? {
            self.retry.max_delay_secs = Some(max);
        }
        if let Some(jitter) = get_env_bool(&key("retry_jitter"))? {
            self.retry.jitter = jitter;
        }
        Ok(())
    }

    fn merge(&mut self, other: Self) -> &mut Self {
        let defaults = Self::default();

        if other.mode != defaults.mode {
            self.mode = other.mode;
        }
        if other.num_workers != defaults.num_workers {
            self.num_workers = other.num_workers;
        }
        if other.show_progress != defaults.show_progress {
            self.show_progress = other.show_progress;
        }
        if other.timeout_secs.is_some() {
            self.timeout_secs = other.timeout_secs;
        }
        if other.retry != defaults.retry {
            self.retry = other.retry;
        }
        self
    }
}
