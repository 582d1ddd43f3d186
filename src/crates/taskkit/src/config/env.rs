//! Environment variable helpers
//!
//! Every helper distinguishes "not set" (`Ok(None)` or the default) from
//! "set but unusable" (`Err(ConfigError::Env)`).

use super::ConfigError;
use std::env;
use std::str::FromStr;

fn env_error(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Env {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Read `key`, returning `None` when it is not set
pub fn get_env(key: &str) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(val) => Ok(Some(val)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(env_error(key, "contains invalid UTF-8")),
    }
}

/// Read and parse `key`
///
/// ```rust,ignore
/// let workers: Option<usize> = get_env_parse("TASKKIT_NUM_WORKERS")?;
/// ```
pub fn get_env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get_env(key)? {
        Some(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| env_error(key, format!("cannot parse {:?}: {}", val, e))),
        None => Ok(None),
    }
}

/// Read `key`, falling back to `default` when it is not set
pub fn get_env_or(key: &str, default: impl Into<String>) -> Result<String, ConfigError> {
    Ok(get_env(key)?.unwrap_or_else(|| default.into()))
}

/// Read and parse `key`, falling back to `default` when it is not set
pub fn get_env_parse_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(get_env_parse(key)?.unwrap_or(default))
}

/// Read a boolean flag
///
/// Accepts `true/1/yes/on` and `false/0/no/off`, case-insensitively.
pub fn get_env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match get_env(key)? {
        Some(val) => match val.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(env_error(key, format!("invalid boolean value {:?}", val))),
        },
        None => Ok(None),
    }
}

/// Build a prefixed variable name, e.g. `("TASKKIT_", "num_workers")` gives
/// `TASKKIT_NUM_WORKERS`
pub fn build_env_key(prefix: &str, name: &str) -> String {
    format!("{}{}", prefix, name.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_missing() {
        assert!(get_env("TASKKIT_TEST_MISSING_VAR_12345").unwrap().is_none());
        assert_eq!(
            get_env_or("TASKKIT_TEST_MISSING_VAR_12345", "default").unwrap(),
            "default"
        );
    }

    #[test]
    fn test_get_env_parse() {
        env::set_var("TASKKIT_TEST_NUMBER", " 42 ");
        let result: Option<usize> = get_env_parse("TASKKIT_TEST_NUMBER").unwrap();
        assert_eq!(result, Some(42));
        env::remove_var("TASKKIT_TEST_NUMBER");
    }

    #[test]
    fn test_get_env_parse_invalid() {
        env::set_var("TASKKIT_TEST_INVALID_NUMBER", "eight");
        let result: Result<Option<usize>, _> = get_env_parse("TASKKIT_TEST_INVALID_NUMBER");
        match result {
            Err(ConfigError::Env { key, .. }) => assert_eq!(key, "TASKKIT_TEST_INVALID_NUMBER"),
            other => panic!("expected env error, got {other:?}"),
        }
        env::remove_var("TASKKIT_TEST_INVALID_NUMBER");
    }

    #[test]
    fn test_get_env_parse_or() {
        let result: f64 = get_env_parse_or("TASKKIT_TEST_MISSING_VAR_12345", 1.5).unwrap();
        assert_eq!(result, 1.5);

        env::set_var("TASKKIT_TEST_DELAY_OR", "0.25");
        let result: f64 = get_env_parse_or("TASKKIT_TEST_DELAY_OR", 1.5).unwrap();
        assert_eq!(result, 0.25);
        env::remove_var("TASKKIT_TEST_DELAY_OR");
    }

    #[test]
    fn test_get_env_bool() {
        let cases = [
            ("true", true),
            ("TRUE", true),
            ("1", true),
            ("yes", true),
            ("on", true),
            ("false", false),
            ("0", false),
            ("No", false),
            ("off", false),
        ];

        for (value, expected) in cases {
            env::set_var("TASKKIT_TEST_BOOL", value);
            let result = get_env_bool("TASKKIT_TEST_BOOL").unwrap();
            assert_eq!(result, Some(expected), "Failed for value: {}", value);
        }
        env::remove_var("TASKKIT_TEST_BOOL");

        env::set_var("TASKKIT_TEST_BOOL_INVALID", "maybe");
        assert!(get_env_bool("TASKKIT_TEST_BOOL_INVALID").is_err());
        env::remove_var("TASKKIT_TEST_BOOL_INVALID");
    }

    #[test]
    fn test_build_env_key() {
        assert_eq!(build_env_key("TASKKIT_", "num_workers"), "TASKKIT_NUM_WORKERS");
        assert_eq!(build_env_key("", "mode"), "MODE");
        assert_eq!(build_env_key("APP_", "retry_max_attempts"), "APP_RETRY_MAX_ATTEMPTS");
    }
}
