//! Latency instrumentation
//!
//! Wrapping a task in [`Timed`] logs how long each call took. The wrapper is
//! purely observational: values and failures pass through untouched.

use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::task::{Named, Task};

/// Log levels for latency lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    #[default]
    Debug,
    Info,
    Warn,
    Error,
}

fn log_latency(level: LogLevel, name: &str, elapsed: Duration) {
    let latency = format_duration(elapsed);
    match level {
        LogLevel::Debug => debug!(task = %name, latency = %latency, "Task latency"),
        LogLevel::Info => info!(task = %name, latency = %latency, "Task latency"),
        LogLevel::Warn => warn!(task = %name, latency = %latency, "Task latency"),
        LogLevel::Error => error!(task = %name, latency = %latency, "Task latency"),
    }
}

/// A task whose calls are timed and logged
#[derive(Debug)]
pub struct Timed<T> {
    inner: T,
    level: LogLevel,
}

impl<T> Timed<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            level: LogLevel::Debug,
        }
    }

    /// Emit latency lines at `level` instead of debug
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }
}

impl<T: Named> Named for Timed<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }
}

impl<Args, T: Task<Args>> Task<Args> for Timed<T> {
    type Output = T::Output;

    fn run(&self, args: Args) -> Result<Self::Output> {
        let start = Instant::now();
        let result = self.inner.run(args);
        log_latency(self.level, self.inner.name(), start.elapsed());
        result
    }
}

/// Time a single closure call
///
/// # Example
///
/// ```rust
/// use taskkit::timed::timed;
///
/// let sum = timed("sum", || (1..=10).sum::<u32>());
/// assert_eq!(sum, 55);
/// ```
pub fn timed<F, T>(name: &str, f: F) -> T
where
    F: FnOnce() -> T,
{
    let start = Instant::now();
    let result = f();
    log_latency(LogLevel::Debug, name, start.elapsed());
    result
}

/// Time a future
pub async fn timed_async<F, T>(name: &str, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = future.await;
    log_latency(LogLevel::Debug, name, start.elapsed());
    result
}

/// Format duration in human-readable form
///
/// # Example
///
/// ```rust
/// use taskkit::timed::format_duration;
/// use std::time::Duration;
///
/// assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
/// assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
/// assert_eq!(format_duration(Duration::from_micros(500)), "500μs");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let micros = duration.as_micros();

    if micros < 1000 {
        format!("{}μs", micros)
    } else if micros < 1_000_000 {
        format!("{}ms", micros / 1000)
    } else if micros < 60_000_000 {
        format!("{:.2}s", micros as f64 / 1_000_000.0)
    } else {
        let seconds = micros / 1_000_000;
        let minutes = seconds / 60;
        let secs = seconds % 60;
        format!("{}m{}s", minutes, secs)
    }
}
