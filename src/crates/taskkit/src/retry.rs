//! Retry with exponential backoff
//!
//! A [`RetryPolicy`] re-invokes a failing call up to `max_attempts` times,
//! sleeping `initial_delay * backoff_factor^(attempt - 1)` seconds after each
//! failed attempt except the last. The terminal failure is logged at error
//! level with its full error chain and surfaced as
//! [`ExecError::RetryExhausted`], whose `source` is the last failure.
//!
//! # Example
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use taskkit::{task, RetryPolicy, Task, TaskExt};
//!
//! let calls = AtomicUsize::new(0);
//! let flaky = task(move |x: u32| {
//!     if calls.fetch_add(1, Ordering::SeqCst) < 2 {
//!         Err("transient")
//!     } else {
//!         Ok(x + 1)
//!     }
//! })
//! .with_retry(RetryPolicy::new(3).with_initial_delay(0.01).with_backoff_factor(2.0));
//!
//! assert_eq!(flaky.run(41).unwrap(), 42);
//! ```

use rand::Rng;
use std::backtrace::BacktraceStatus;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::ConfigError;
use crate::error::{format_error_chain, ExecError, Result};
use crate::task::{Named, Task};

type RetryPredicate = Arc<dyn Fn(&ExecError) -> bool + Send + Sync>;
type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Configuration for retrying failed calls
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: usize,

    /// Delay after the first failed attempt, in seconds
    pub initial_delay: f64,

    /// Multiplier applied to the delay after each further failure
    pub backoff_factor: f64,

    /// Optional cap on a single delay, in seconds
    pub max_delay: Option<f64>,

    /// Whether to scale delays by a random factor in `[0.5, 1.5]`
    pub jitter: bool,

    retry_if: Option<RetryPredicate>,
    sleeper: Sleeper,
}

impl RetryPolicy {
    /// Create a policy with the given max attempts, a 1 second fixed delay,
    /// no cap and no jitter
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_delay: 1.0,
            backoff_factor: 1.0,
            max_delay: None,
            jitter: false,
            retry_if: None,
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    /// Set the delay after the first failure
    pub fn with_initial_delay(mut self, seconds: f64) -> Self {
        self.initial_delay = seconds;
        self
    }

    /// Set the backoff factor (1.0 keeps a fixed interval)
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Cap each delay at `seconds`
    pub fn with_max_delay(mut self, seconds: f64) -> Self {
        self.max_delay = Some(seconds);
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Only retry failures for which `predicate` returns true
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ExecError) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Replace the function used to wait between attempts
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Fn(Duration) + Send + Sync + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Check the policy invariants
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if !self.initial_delay.is_finite() || self.initial_delay < 0.0 {
            return Err(ConfigError::invalid(
                "initial_delay",
                "must be a finite, non-negative number of seconds",
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::invalid("backoff_factor", "must be >= 1"));
        }
        if let Some(max) = self.max_delay {
            if !max.is_finite() || max < 0.0 {
                return Err(ConfigError::invalid(
                    "max_delay",
                    "must be a finite, non-negative number of seconds",
                ));
            }
        }
        Ok(())
    }

    /// Delay slept after the failed attempt number `attempt` (1-based)
    ///
    /// `initial_delay * backoff_factor^(attempt - 1)`, then capped and
    /// jittered when configured.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        if self.initial_delay == 0.0 {
            return Duration::ZERO;
        }
        let mut delay = self.initial_delay * self.backoff_factor.powi(exponent);

        if let Some(max) = self.max_delay {
            delay = delay.min(max);
        }

        if self.jitter {
            let mut rng = rand::thread_rng();
            delay *= rng.gen_range(0.5..=1.5);
        }

        Duration::try_from_secs_f64(delay).unwrap_or(Duration::MAX)
    }

    /// Check if another attempt is allowed after `attempt` attempts
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }

    /// Wrap a task so each call is retried under this policy
    pub fn wrap<T: Named>(self, task: T) -> Retry<T> {
        Retry::new(task, self)
    }

    /// Decide what follows a failed attempt: the delay before the next one,
    /// or the terminal error
    fn on_failure(&self, name: &str, attempt: usize, err: ExecError) -> Result<Duration> {
        let retryable = self.retry_if.as_ref().map_or(true, |p| p(&err));

        if retryable && self.should_retry(attempt) {
            let delay = self.calculate_delay(attempt);
            debug!(
                task = %name,
                attempt,
                max_attempts = self.max_attempts,
                delay = ?delay,
                error = %err,
                "Attempt failed, retrying"
            );
            return Ok(delay);
        }

        let exhausted = ExecError::RetryExhausted {
            name: name.to_string(),
            attempts: attempt,
            source: Box::new(err),
        };

        if retryable {
            error!(task = %name, attempts = attempt, "Task failed after all attempts");
        } else {
            error!(task = %name, attempts = attempt, "Task failed with a non-retryable error");
        }
        for line in format_error_chain(&exhausted).lines() {
            error!("{}", line.trim_start());
        }
        if let Some(failure) = exhausted.task_failure() {
            if failure.backtrace().status() == BacktraceStatus::Captured {
                error!("\n{}", failure.backtrace());
            }
        }

        Err(exhausted)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("retry_if", &self.retry_if.is_some())
            .finish()
    }
}

/// Execute a call with retry logic
///
/// `operation` is invoked up to `policy.max_attempts` times; it must be safe to
/// repeat.
pub fn with_retry<F, T>(policy: &RetryPolicy, name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    policy.validate()?;

    let mut attempt = 1;
    loop {
        match operation() {
            Ok(value) => {
                if attempt > 1 {
                    debug!(task = %name, attempt, "Retry succeeded");
                }
                return Ok(value);
            }
            Err(err) => {
                let delay = policy.on_failure(name, attempt, err)?;
                (policy.sleeper)(delay);
                attempt += 1;
            }
        }
    }
}

/// Async counterpart of [`with_retry`], sleeping on the tokio timer
///
/// The policy's custom sleeper is not used here.
pub async fn with_retry_async<F, Fut, T>(
    policy: &RetryPolicy,
    name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    policy.validate()?;

    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(task = %name, attempt, "Retry succeeded");
                }
                return Ok(value);
            }
            Err(err) => {
                let delay = policy.on_failure(name, attempt, err)?;
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// A task whose calls are retried under a [`RetryPolicy`]
///
/// Arguments are cloned for every attempt.
#[derive(Debug)]
pub struct Retry<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> Retry<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<T: Named> Named for Retry<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }
}

impl<Args, T> Task<Args> for Retry<T>
where
    Args: Clone,
    T: Task<Args>,
{
    type Output = T::Output;

    fn run(&self, args: Args) -> Result<Self::Output> {
        with_retry(&self.policy, self.inner.name(), || self.inner.run(args.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskFailure;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    fn failure(msg: &str) -> ExecError {
        TaskFailure::new("op", msg.to_string()).into()
    }

    fn recording_policy(max_attempts: usize) -> (RetryPolicy, Arc<Mutex<Vec<Duration>>>) {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let sink = slept.clone();
        let policy = RetryPolicy::new(max_attempts)
            .with_initial_delay(0.5)
            .with_backoff_factor(2.0)
            .with_sleeper(move |d| sink.lock().unwrap().push(d));
        (policy, slept)
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, 1.0);
        assert_eq!(policy.backoff_factor, 1.0);
        assert_eq!(policy.max_delay, None);
        assert!(!policy.jitter);
    }

    #[test]
    fn test_retry_policy_builder() {
        let policy = RetryPolicy::new(5)
            .with_initial_delay(1.5)
            .with_backoff_factor(3.0)
            .with_max_delay(60.0)
            .with_jitter(true);

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, 1.5);
        assert_eq!(policy.backoff_factor, 3.0);
        assert_eq!(policy.max_delay, Some(60.0));
        assert!(policy.jitter);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::new(5)
            .with_initial_delay(1.0)
            .with_backoff_factor(2.0);

        assert_eq!(policy.calculate_delay(1).as_secs_f64(), 1.0);
        assert_eq!(policy.calculate_delay(2).as_secs_f64(), 2.0);
        assert_eq!(policy.calculate_delay(3).as_secs_f64(), 4.0);
        assert_eq!(policy.calculate_delay(4).as_secs_f64(), 8.0);
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::new(4).with_initial_delay(2.0);
        for attempt in 1..4 {
            assert_eq!(policy.calculate_delay(attempt).as_secs_f64(), 2.0);
        }
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::new(10)
            .with_initial_delay(10.0)
            .with_backoff_factor(2.0)
            .with_max_delay(50.0);

        // 10 * 2^5 = 320, capped
        assert_eq!(policy.calculate_delay(6).as_secs_f64(), 50.0);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::new(5)
            .with_initial_delay(1.0)
            .with_backoff_factor(2.0)
            .with_jitter(true);

        for _ in 0..20 {
            let delay = policy.calculate_delay(3).as_secs_f64();
            assert!((2.0..=6.0).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_huge_delay_saturates() {
        let policy = RetryPolicy::new(2000)
            .with_initial_delay(1.0)
            .with_backoff_factor(10.0);
        assert_eq!(policy.calculate_delay(1000), Duration::MAX);
    }

    #[test]
    fn test_zero_delay_stays_zero_for_huge_exponents() {
        let policy = RetryPolicy::new(2000)
            .with_initial_delay(0.0)
            .with_backoff_factor(10.0);
        assert_eq!(policy.calculate_delay(400), Duration::ZERO);
        assert_eq!(policy.calculate_delay(1999), Duration::ZERO);
        assert_eq!(policy.clone().with_jitter(true).calculate_delay(400), Duration::ZERO);
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::new(1).validate().is_ok());
        assert!(RetryPolicy::new(0).validate().is_err());
        assert!(RetryPolicy::new(3).with_initial_delay(-1.0).validate().is_err());
        assert!(RetryPolicy::new(3).with_initial_delay(f64::NAN).validate().is_err());
        assert!(RetryPolicy::new(3).with_backoff_factor(0.5).validate().is_err());
        assert!(RetryPolicy::new(3).with_max_delay(-2.0).validate().is_err());
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::new(3);

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn test_with_retry_success_first_attempt() {
        let (policy, slept) = recording_policy(3);
        let calls = AtomicUsize::new(0);

        let result = with_retry(&policy, "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("success")
        });

        assert_eq!(result.unwrap(), "success");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(slept.lock().unwrap().is_empty());
    }

    #[test]
    fn test_with_retry_success_after_failures() {
        let (policy, slept) = recording_policy(5);
        let calls = AtomicUsize::new(0);

        let result = with_retry(&policy, "op", || {
            let current = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if current < 3 {
                Err(failure("transient error"))
            } else {
                Ok(current)
            }
        });

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            *slept.lock().unwrap(),
            vec![Duration::from_millis(500), Duration::from_secs(1)]
        );
    }

    #[test]
    fn test_with_retry_all_attempts_fail() {
        let (policy, slept) = recording_policy(3);
        let calls = AtomicUsize::new(0);

        let result: Result<()> = with_retry(&policy, "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(failure(&format!("persistent error {n}")))
        });

        let err = result.unwrap_err();
        match &err {
            ExecError::RetryExhausted { name, attempts, .. } => {
                assert_eq!(name, "op");
                assert_eq!(*attempts, 3);
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        assert_eq!(
            err.task_failure().unwrap().cause().to_string(),
            "persistent error 3"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(slept.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_single_attempt_never_sleeps() {
        let (policy, slept) = recording_policy(1);
        let calls = AtomicUsize::new(0);

        let result: Result<()> = with_retry(&policy, "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(failure("nope"))
        });

        assert!(matches!(result, Err(ExecError::RetryExhausted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(slept.lock().unwrap().is_empty());
    }

    #[test]
    fn test_retry_if_stops_on_permanent_error() {
        let (policy, slept) = recording_policy(5);
        let policy = policy.retry_if(|e| !e.to_string().contains("permanent"));
        let calls = AtomicUsize::new(0);

        let result: Result<()> = with_retry(&policy, "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(failure("permanent"))
        });

        assert!(matches!(result, Err(ExecError::RetryExhausted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(slept.lock().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_policy_is_config_error() {
        let result = with_retry(&RetryPolicy::new(0), "op", || Ok(1));
        assert_eq!(result.unwrap_err().error_code(), "E_CONFIG");
    }

    #[tokio::test]
    async fn test_with_retry_async_success_after_failures() {
        let policy = RetryPolicy::new(3).with_initial_delay(0.01);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = with_retry_async(&policy, "async-op", move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(failure("transient"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_async_exhausts() {
        let policy = RetryPolicy::new(2).with_initial_delay(0.0);

        let result: Result<()> =
            with_retry_async(&policy, "async-op", || async { Err(failure("down")) }).await;

        assert!(matches!(result, Err(ExecError::RetryExhausted { attempts: 2, .. })));
    }

    #[test]
    #[traced_test]
    fn test_failed_attempts_are_logged_with_delay() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(3)
            .with_initial_delay(0.25)
            .with_sleeper(|_| {});

        let result = with_retry(&policy, "flaky-op", || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(failure("not yet"))
            } else {
                Ok(7)
            }
        });

        assert_eq!(result.unwrap(), 7);
        assert!(logs_contain("Attempt failed, retrying"));
        assert!(logs_contain("attempt=1"));
        assert!(logs_contain("attempt=2"));
        assert!(logs_contain("delay=250ms"));
        assert!(!logs_contain("Task failed after all attempts"));
    }

    #[test]
    #[traced_test]
    fn test_terminal_failure_logs_error_chain() {
        let policy = RetryPolicy::new(2)
            .with_initial_delay(0.0)
            .with_sleeper(|_| {});

        let result: Result<()> = with_retry(&policy, "doomed-op", || Err(failure("disk on fire")));

        assert!(result.is_err());
        assert!(logs_contain("Task failed after all attempts"));
        assert!(logs_contain("Caused by:"));
        assert!(logs_contain("disk on fire"));
    }

    #[test]
    #[traced_test]
    fn test_single_successful_attempt_logs_nothing() {
        let policy = RetryPolicy::new(1);

        let result = with_retry(&policy, "quiet-op", || Ok::<_, ExecError>("done"));

        assert_eq!(result.unwrap(), "done");
        assert!(!logs_contain("taskkit::retry"));
    }
}
