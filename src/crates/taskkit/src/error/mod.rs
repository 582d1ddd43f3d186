//! Error types for task execution
//!
//! Every failure surfaced by the toolkit is an [`ExecError`]. The variant names
//! the stage that produced it (task body, retry loop, timeout guard, parallel
//! map, pool plumbing) and the original cause stays reachable through
//! [`std::error::Error::source`].
//!
//! # Example
//!
//! ```rust
//! use taskkit::{task, Task, ExecError};
//!
//! let parse = task(|s: &'static str| s.parse::<i32>());
//! let err = parse.run("nope").unwrap_err();
//!
//! assert_eq!(err.error_code(), "E_TASK");
//! assert!(err.task_failure().is_some());
//! ```

mod chain;

pub use chain::{error_chain_length, format_error_chain, root_cause};

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Boxed error accepted from user task bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for execution operations
pub type Result<T> = std::result::Result<T, ExecError>;

/// Errors surfaced by the retry, timeout and parallel-map layers
#[derive(Debug, Error)]
pub enum ExecError {
    /// The wrapped function returned an error or panicked
    #[error(transparent)]
    Task(#[from] TaskFailure),

    /// Every permitted attempt failed
    #[error("task `{name}` failed after {attempts} attempt(s)")]
    RetryExhausted {
        name: String,
        attempts: usize,
        #[source]
        source: Box<ExecError>,
    },

    /// The deadline elapsed before the call completed
    #[error("task `{name}` timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// A task inside a parallel map failed, aborting the whole map
    #[error("parallel map aborted: input #{index} failed")]
    Aggregation {
        index: usize,
        #[source]
        source: Box<ExecError>,
    },

    /// Invalid policy or options
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Worker pool could not be built or a worker was lost
    #[error("worker pool error: {0}")]
    Pool(String),

    /// I/O error talking to worker processes
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload could not cross the process boundary
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecError {
    /// Get the canonical error code for the stage that failed
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Task(_) => "E_TASK",
            Self::RetryExhausted { .. } => "E_RETRY_EXHAUSTED",
            Self::Timeout { .. } => "E_TIMEOUT",
            Self::Aggregation { .. } => "E_AGGREGATION",
            Self::Config(_) => "E_CONFIG",
            Self::Pool(_) => "E_POOL",
            Self::Io(_) => "E_IO",
            Self::Serialization(_) => "E_SERIALIZATION",
        }
    }

    /// Walk nested retry/aggregation layers down to the originating task failure
    pub fn task_failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::Task(failure) => Some(failure),
            Self::RetryExhausted { source, .. } | Self::Aggregation { source, .. } => {
                source.task_failure()
            }
            _ => None,
        }
    }

    /// Whether the innermost stage was a timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::RetryExhausted { source, .. } | Self::Aggregation { source, .. } => {
                source.is_timeout()
            }
            _ => false,
        }
    }

    pub(crate) fn pool(msg: impl Into<String>) -> Self {
        Self::Pool(msg.into())
    }
}

/// Failure raised by a task body, with the original cause and a backtrace
///
/// The backtrace is captured where the failure is converted, so it follows the
/// usual `RUST_BACKTRACE` / `RUST_LIB_BACKTRACE` switches.
#[derive(Debug, Error)]
#[error("task `{name}` failed: {source}")]
pub struct TaskFailure {
    name: String,
    #[source]
    source: BoxError,
    backtrace: Box<Backtrace>,
}

impl TaskFailure {
    /// Wrap an error returned by the task called `name`
    pub fn new(name: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            backtrace: Box::new(Backtrace::capture()),
        }
    }

    /// Build a failure from a caught panic payload
    pub fn from_panic(name: impl Into<String>, payload: Box<dyn Any + Send>) -> Self {
        Self::new(name, PanicError(panic_message(payload.as_ref())))
    }

    /// Name of the task that failed
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The error returned by the task body
    pub fn cause(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &*self.source
    }

    /// Backtrace captured when the failure was recorded
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Attempt to downcast the original error
    pub fn downcast_ref<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.downcast_ref::<E>()
    }
}

/// A task body panicked
#[derive(Debug, Error)]
#[error("panicked: {0}")]
pub struct PanicError(pub String);

/// Error reported by a worker process, reconstructed on the parent side
///
/// Only the rendered messages cross the process boundary; `chain` holds the
/// `source()` messages below the top-level one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub message: String,
    pub chain: Vec<String>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.chain {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_failure_keeps_source_and_backtrace() {
        let failure = TaskFailure::new("t", "boom");
        let source = std::error::Error::source(&failure).unwrap();
        assert_eq!(source.to_string(), "boom");
        assert_eq!(failure.to_string(), "task `t` failed: boom");
        // Status depends on RUST_BACKTRACE; it only has to be reachable
        let _ = failure.backtrace().status();
    }

    #[test]
    fn test_error_codes() {
        let task = ExecError::Task(TaskFailure::new("t", "boom"));
        assert_eq!(task.error_code(), "E_TASK");

        let timeout = ExecError::Timeout {
            name: "t".into(),
            timeout: Duration::from_millis(5),
        };
        assert_eq!(timeout.error_code(), "E_TIMEOUT");
        assert_eq!(ExecError::pool("gone").error_code(), "E_POOL");
    }

    #[test]
    fn test_task_failure_through_layers() {
        let err = ExecError::Aggregation {
            index: 7,
            source: Box::new(ExecError::RetryExhausted {
                name: "fetch".into(),
                attempts: 3,
                source: Box::new(TaskFailure::new("fetch", "connection reset").into()),
            }),
        };

        let failure = err.task_failure().unwrap();
        assert_eq!(failure.name(), "fetch");
        assert_eq!(failure.cause().to_string(), "connection reset");
        assert!(!err.is_timeout());
        assert_eq!(error_chain_length(&err), 4);
    }

    #[test]
    fn test_timeout_detected_under_retry() {
        let err = ExecError::RetryExhausted {
            name: "slow".into(),
            attempts: 2,
            source: Box::new(ExecError::Timeout {
                name: "slow".into(),
                timeout: Duration::from_secs(1),
            }),
        };
        assert!(err.is_timeout());
        assert!(err.task_failure().is_none());
    }

    #[test]
    fn test_display() {
        let err = ExecError::Task(TaskFailure::new("parse", "bad digit"));
        assert_eq!(err.to_string(), "task `parse` failed: bad digit");

        let err = ExecError::Aggregation {
            index: 50,
            source: Box::new(err),
        };
        assert_eq!(err.to_string(), "parallel map aborted: input #50 failed");
    }

    #[test]
    fn test_panic_payloads() {
        let failure = TaskFailure::from_panic("p", Box::new("static str"));
        assert_eq!(failure.cause().to_string(), "panicked: static str");

        let failure = TaskFailure::from_panic("p", Box::new(String::from("owned")));
        assert_eq!(failure.cause().to_string(), "panicked: owned");

        let failure = TaskFailure::from_panic("p", Box::new(42u8));
        assert!(failure.downcast_ref::<PanicError>().is_some());
    }

    #[test]
    fn test_remote_error_display() {
        let err = RemoteError {
            message: "division failed".into(),
            chain: vec!["divide by zero".into()],
        };
        assert_eq!(err.to_string(), "division failed: divide by zero");
    }
}
