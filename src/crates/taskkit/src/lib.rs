//! Execution-control toolkit: retries, timeouts, latency logging and
//! order-preserving parallel maps
//!
//! Work is expressed as a [`Task`]: a named callable returning
//! `Result<Output, ExecError>`. Wrappers add one behaviour each and are tasks
//! themselves, so they compose by nesting; wrapping order decides the order of
//! effect (retry around timeout retries each bounded call, timeout around retry
//! bounds the whole loop).
//!
//! # Modules
//!
//! - `task` - The `Task` trait, closure adapters and wrapping combinators
//! - `retry` - Retry with exponential backoff
//! - `timeout` - Timeout-bounded calls on a dedicated single-slot worker
//! - `timed` - Latency instrumentation
//! - `parallel` - Parallel map over thread or process pools
//! - `worker` - Jobs that can run in worker processes
//! - `jobs` - Stock jobs served by the `taskkit` binary
//! - `config` - Execution defaults from files and environment variables
//! - `error` - Error taxonomy and chain formatting
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use taskkit::{parallel_map, task, MapOptions, RetryPolicy, TaskExt, TimeoutGuard};
//!
//! let guard = TimeoutGuard::new()?;
//! let square = task(|x: u64| Ok::<_, std::io::Error>(x * x))
//!     .with_timeout(&guard, Duration::from_secs(5))
//!     .with_retry(RetryPolicy::new(3).with_initial_delay(0.1))
//!     .timed();
//!
//! let options = MapOptions::new().with_num_workers(4).with_progress(false);
//! let squares = parallel_map(1..=5, square, &options)?;
//! assert_eq!(squares, vec![1, 4, 9, 16, 25]);
//! # Ok::<(), taskkit::ExecError>(())
//! ```

pub mod config;
pub mod error;
pub mod jobs;
pub mod parallel;
pub mod retry;
pub mod task;
pub mod timed;
pub mod timeout;
pub mod worker;

pub use error::{format_error_chain, BoxError, ExecError, RemoteError, Result, TaskFailure};
pub use parallel::{parallel_map, parallel_map_job, MapOptions, Mode, ProgressObserver};
pub use retry::{with_retry, with_retry_async, Retry, RetryPolicy};
pub use task::{named_task, task, FnTask, Named, Task, TaskExt};
pub use timed::{timed, timed_async, LogLevel, Timed};
pub use timeout::{with_timeout_async, Timeout, TimeoutGuard};
pub use worker::{Job, JobRegistry};

/// Get version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let v = version();
        assert!(!v.is_empty());
    }
}
