//! Configuration builder trait
//!
//! Gives configuration structures one shape for validation, environment
//! overrides and merging.

use super::ConfigError;

/// Trait for configuration structures that support building, validation, and merging
///
/// # Example
///
/// ```rust
/// use taskkit::config::{get_env_parse, ConfigBuilder, ConfigError};
///
/// #[derive(Clone, Default)]
/// struct PoolConfig {
///     workers: usize,
/// }
///
/// impl ConfigBuilder for PoolConfig {
///     fn validate(&self) -> Result<(), ConfigError> {
///         Ok(())
///     }
///
///     fn apply_env(&mut self, prefix: &str) -> Result<(), ConfigError> {
///         if let Some(workers) = get_env_parse(&format!("{}WORKERS", prefix))? {
///             self.workers = workers;
///         }
///         Ok(())
///     }
///
///     fn merge(&mut self, other: Self) -> &mut Self {
///         if other.workers != 0 {
///             self.workers = other.workers;
///         }
///         self
///     }
/// }
///
/// let config = PoolConfig::from_env("POOL_DOCTEST_").unwrap();
/// assert_eq!(config.workers, 0);
/// ```
pub trait ConfigBuilder: Default + Clone {
    /// Validate the configuration
    ///
    /// Returns an error if a value is out of range or fields contradict
    /// each other.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Override fields from environment variables named `{PREFIX}{FIELD}`
    ///
    /// Variables that are not set leave the field untouched.
    fn apply_env(&mut self, prefix: &str) -> Result<(), ConfigError>;

    /// Merge another configuration into this one
    ///
    /// Fields of `other` that differ from the defaults overwrite the
    /// corresponding fields of `self`. Returns self for chaining.
    fn merge(&mut self, other: Self) -> &mut Self;

    /// Create, validate, and return the default configuration
    fn build() -> Result<Self, ConfigError> {
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the environment
    fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(prefix)?;
        Ok(config)
    }

    /// Defaults overridden by the environment, then validated
    fn from_env_with_defaults(prefix: &str) -> Result<Self, ConfigError> {
        let config = Self::from_env(prefix)?;
        config.validate()?;
        Ok(config)
    }
}
