//! Timeout-bounded calls on a dedicated single-slot worker
//!
//! A [`TimeoutGuard`] owns one background thread. Guarded calls are queued to
//! that thread and the caller waits at most the given timeout, measured from
//! submission, for the result.
//!
//! Cancellation is best-effort: when the deadline passes the caller gets
//! [`ExecError::Timeout`], but the call is *not* interrupted. It runs to
//! completion on the worker and its result is discarded. Because the worker
//! has a single slot, calls through one guard (and its clones) run one at a
//! time, and a call stuck behind a slow one spends its deadline waiting.
//! Create separate guards for calls that must not contend.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use taskkit::{ExecError, TimeoutGuard};
//!
//! let guard = TimeoutGuard::new().unwrap();
//!
//! let fast = guard.call("fast", Duration::from_secs(1), || Ok(7));
//! assert_eq!(fast.unwrap(), 7);
//!
//! let slow = guard.call("slow", Duration::from_millis(20), || {
//!     std::thread::sleep(Duration::from_millis(200));
//!     Ok(())
//! });
//! assert!(matches!(slow, Err(ExecError::Timeout { .. })));
//! ```

use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::error::{ExecError, Result, TaskFailure};
use crate::task::{Named, Task};

type Job = Box<dyn FnOnce() + Send + 'static>;

static GUARD_IDS: AtomicUsize = AtomicUsize::new(0);

/// Handle to a single-slot executor used for timeout-bounded calls
///
/// Cloning the handle shares the same worker thread. The thread exits once
/// every handle (including those held by [`Timeout`] wrappers) is dropped and
/// its queue has drained.
#[derive(Clone)]
pub struct TimeoutGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    id: usize,
    jobs: mpsc::Sender<Job>,
}

impl TimeoutGuard {
    /// Start a guard with its own worker thread
    pub fn new() -> Result<Self> {
        let id = GUARD_IDS.fetch_add(1, Ordering::Relaxed);
        let (jobs, queue) = mpsc::channel::<Job>();

        thread::Builder::new()
            .name(format!("taskkit-timeout-{id}"))
            .spawn(move || {
                for job in queue {
                    job();
                }
                debug!(guard = id, "Timeout worker stopped");
            })?;

        debug!(guard = id, "Timeout worker started");
        Ok(Self {
            inner: Arc::new(GuardInner { id, jobs }),
        })
    }

    /// Run `f` on the guard's worker and wait at most `timeout` for it
    ///
    /// A panic inside `f` is reported as a task failure; the worker survives.
    pub fn call<F, T>(&self, name: &str, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        if timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be greater than zero").into());
        }

        let (reply, outcome) = mpsc::sync_channel::<Result<T>>(1);
        let task_name = name.to_string();
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|payload| Err(TaskFailure::from_panic(task_name, payload).into()));
            // The caller may have stopped waiting
            let _ = reply.send(result);
        });

        self.inner
            .jobs
            .send(job)
            .map_err(|_| ExecError::pool("timeout worker has stopped"))?;

        match outcome.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    task = %name,
                    guard = self.inner.id,
                    timeout = ?timeout,
                    "Call timed out, leaving it running in the background"
                );
                Err(ExecError::Timeout {
                    name: name.to_string(),
                    timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(ExecError::pool("timeout worker dropped the call"))
            }
        }
    }

    /// Wrap a task so every call is bounded by `timeout`
    pub fn wrap<T: Named>(&self, task: T, timeout: Duration) -> Timeout<T> {
        Timeout {
            inner: Arc::new(task),
            guard: self.clone(),
            timeout,
        }
    }
}

impl fmt::Debug for TimeoutGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutGuard").field("id", &self.inner.id).finish()
    }
}

/// A task whose calls are bounded by a deadline on a [`TimeoutGuard`]
#[derive(Debug)]
pub struct Timeout<T> {
    inner: Arc<T>,
    guard: TimeoutGuard,
    timeout: Duration,
}

impl<T> Timeout<T> {
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<T: Named> Named for Timeout<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }
}

impl<Args, T> Task<Args> for Timeout<T>
where
    Args: Send + 'static,
    T: Task<Args> + 'static,
    T::Output: Send + 'static,
{
    type Output = T::Output;

    fn run(&self, args: Args) -> Result<Self::Output> {
        let inner = self.inner.clone();
        self.guard
            .call(self.inner.name(), self.timeout, move || inner.run(args))
    }
}

/// Bound a future by `timeout` on the tokio timer
///
/// Unlike [`TimeoutGuard::call`], the future is dropped when the deadline
/// passes.
pub async fn with_timeout_async<F, T>(name: &str, timeout: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_elapsed) => {
            warn!(task = %name, timeout = ?timeout, "Future timed out");
            Err(ExecError::Timeout {
                name: name.to_string(),
                timeout,
            })
        }
    }
}
