//! Configuration for execution defaults
//!
//! [`ExecutionConfig`] collects the knobs a host application usually wants to
//! set once: pool mode and size, progress display, a default timeout and a
//! default retry policy. It is layered the same way everywhere:
//!
//! 1. built-in defaults
//! 2. an optional YAML or JSON file ([`ExecutionConfig::load_file`])
//! 3. environment variables with a prefix, e.g. `TASKKIT_NUM_WORKERS`
//!
//! # Example
//!
//! ```rust
//! use taskkit::config::{ConfigBuilder, ExecutionConfig};
//!
//! let config = ExecutionConfig::from_env_with_defaults("TASKKIT_DOCTEST_")?;
//! let options = config.map_options();
//! assert_eq!(options.num_workers, 8);
//! # Ok::<(), taskkit::config::ConfigError>(())
//! ```

mod builder;
mod env;
mod schema;

pub use builder::ConfigBuilder;
pub use env::{
    build_env_key, get_env, get_env_bool, get_env_or, get_env_parse, get_env_parse_or,
};
pub use schema::{ExecutionConfig, RetrySettings, DEFAULT_ENV_PREFIX};

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while building or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A value is out of its allowed range
    #[error("invalid value for `{field}`: {message}")]
    Invalid { field: String, message: String },

    /// An environment variable is present but unusable
    #[error("environment variable {key}: {message}")]
    Env { key: String, message: String },

    /// A config file could not be read
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A config file could not be parsed
    #[error("failed to parse config file {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    /// The file extension is neither YAML nor JSON
    #[error("unsupported config file format: {}", .0.display())]
    UnsupportedFormat(PathBuf),
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}
