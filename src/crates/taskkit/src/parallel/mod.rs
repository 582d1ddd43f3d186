//! Order-preserving parallel map over a bounded worker pool
//!
//! Two pool flavours are available, selected per call through [`Mode`]:
//!
//! - [`Mode::Thread`] runs tasks on a rayon pool sharing the caller's memory.
//!   Any [`Task`] works, including closures wrapped with retry, timeout or
//!   latency logging.
//! - [`Mode::Process`] runs a registered [`Job`] in isolated worker processes
//!   that exchange JSON lines with the parent (see [`crate::worker`]).
//!
//! Either way the result sequence has one entry per input, in input order. The
//! first failing task aborts the map with [`ExecError::Aggregation`]; no
//! partial results are returned.
//!
//! # Example
//!
//! ```rust
//! use taskkit::{parallel_map, task, MapOptions};
//!
//! let options = MapOptions::new().with_num_workers(4).with_progress(false);
//! let doubled = parallel_map(0..10, task(|x: u32| Ok::<_, String>(x * 2)), &options).unwrap();
//! assert_eq!(doubled, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
//! ```

mod process_pool;
mod progress;
mod thread_pool;

pub use progress::ProgressObserver;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::error::{ExecError, Result};
use crate::task::Task;
use crate::worker::{ensure_not_worker, Job, JobTask};
use progress::Progress;

/// Worker pool flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Shared-memory threads, for I/O-bound work
    #[default]
    Thread,
    /// Isolated worker processes, for CPU-bound work
    Process,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Thread => "thread",
            Mode::Process => "process",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" | "threads" => Ok(Mode::Thread),
            "process" | "processes" => Ok(Mode::Process),
            other => Err(ConfigError::invalid(
                "mode",
                format!("unknown mode `{other}`, expected `thread` or `process`"),
            )),
        }
    }
}

/// Options for one parallel map
#[derive(Clone)]
pub struct MapOptions {
    /// Pool flavour
    pub mode: Mode,

    /// Upper bound on tasks in flight
    pub num_workers: usize,

    /// Draw a progress bar on stderr when the input length is known
    pub show_progress: bool,

    /// Number of inputs, when the iterator cannot report it exactly
    pub total: Option<usize>,

    /// Executable started for process workers; defaults to the current one
    pub worker_program: Option<PathBuf>,

    observer: Option<ProgressObserver>,
}

impl MapOptions {
    /// Thread mode, 8 workers, progress on
    pub fn new() -> Self {
        Self {
            mode: Mode::Thread,
            num_workers: 8,
            show_progress: true,
            total: None,
            worker_program: None,
            observer: None,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn with_total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    /// Call `observer(completed, total)` after every completed task
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(usize, Option<usize>) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::invalid("num_workers", "must be at least 1"));
        }
        Ok(())
    }

    /// Explicit total, else the iterator's exact size hint
    fn resolve_total<I: Iterator>(&self, inputs: &I) -> Option<usize> {
        if self.total.is_some() {
            return self.total;
        }
        match inputs.size_hint() {
            (lower, Some(upper)) if lower == upper => Some(lower),
            _ => None,
        }
    }

    fn progress(&self, total: Option<usize>) -> Progress {
        if self.show_progress && total.is_none() {
            debug!("Input length unknown, progress bar disabled");
        }
        Progress::new(self.show_progress, total, self.observer.clone())
    }
}

impl Default for MapOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MapOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapOptions")
            .field("mode", &self.mode)
            .field("num_workers", &self.num_workers)
            .field("show_progress", &self.show_progress)
            .field("total", &self.total)
            .field("worker_program", &self.worker_program)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Apply `task` to every input on a thread pool, returning results in input
/// order
///
/// Tuple inputs are spread over multi-parameter closures (see
/// [`crate::task`]). Closures cannot cross a process boundary, so
/// [`Mode::Process`] is rejected here; use [`parallel_map_job`] with a
/// registered [`Job`] instead.
pub fn parallel_map<I, T>(inputs: I, task: T, options: &MapOptions) -> Result<Vec<T::Output>>
where
    I: IntoIterator,
    I::Item: Send + 'static,
    T: Task<I::Item> + 'static,
    T::Output: Send + 'static,
{
    options.validate()?;
    if options.mode == Mode::Process {
        return Err(ConfigError::invalid(
            "mode",
            "process mode needs a registered job, use parallel_map_job",
        )
        .into());
    }

    let inputs = inputs.into_iter();
    let total = options.resolve_total(&inputs);
    info!(
        task = %task.name(),
        mode = %options.mode,
        workers = options.num_workers,
        total = ?total,
        "Starting parallel map"
    );

    thread_pool::map(
        inputs,
        Arc::new(task),
        options.num_workers,
        options.progress(total),
    )
}

/// Apply a registered job to every input, in threads or worker processes
///
/// In process mode every worker is a fresh instance of
/// `options.worker_program` (the current executable unless set) that must
/// have `job` registered and call [`crate::worker::serve_if_requested`] at
/// startup.
pub fn parallel_map_job<I, J>(inputs: I, job: J, options: &MapOptions) -> Result<Vec<J::Output>>
where
    I: IntoIterator<Item = J::Input>,
    J: Job + 'static,
{
    options.validate()?;

    let inputs = inputs.into_iter();
    let total = options.resolve_total(&inputs);
    info!(
        job = J::NAME,
        mode = %options.mode,
        workers = options.num_workers,
        total = ?total,
        "Starting parallel map"
    );

    match options.mode {
        Mode::Thread => {
            thread_pool::map(
                inputs,
                Arc::new(JobTask(job)),
                options.num_workers,
                options.progress(total),
            )
        }
        Mode::Process => {
            ensure_not_worker()?;
            let program = match &options.worker_program {
                Some(program) => program.clone(),
                None => std::env::current_exe()?,
            };
            process_pool::map::<J, _>(
                inputs,
                &program,
                options.num_workers,
                options.progress(total),
            )
        }
    }
}

/// Results gathered out of order, put back into input order
struct Collector<T> {
    slots: Vec<Option<T>>,
    failure: Option<(usize, ExecError)>,
    progress: Progress,
}

impl<T> Collector<T> {
    fn new(progress: Progress) -> Self {
        Self {
            slots: Vec::new(),
            failure: None,
            progress,
        }
    }

    /// Reserve the slot for the next input and return its index
    fn reserve(&mut self) -> usize {
        self.slots.push(None);
        self.slots.len() - 1
    }

    fn failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Record a finished task; only the first failure is kept
    fn record(&mut self, index: usize, result: Result<T>) {
        match result {
            Ok(value) => {
                self.slots[index] = Some(value);
                self.progress.inc();
            }
            Err(err) => {
                if self.failure.is_none() {
                    debug!(index, error = %err, "Task failed, aborting map");
                    self.failure = Some((index, err));
                }
            }
        }
    }

    /// Record a failure that did not come from a task, unless one is already
    /// recorded
    fn fail(&mut self, index: usize, err: ExecError) {
        if self.failure.is_none() {
            self.failure = Some((index, err));
        }
    }

    fn finish(self) -> Result<Vec<T>> {
        if let Some((index, source)) = self.failure {
            self.progress.abandon();
            return Err(ExecError::Aggregation {
                index,
                source: Box::new(source),
            });
        }

        let results = self
            .slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| ExecError::pool(format!("no result for input #{index}")))
            })
            .collect::<Result<Vec<_>>>()?;

        self.progress.finish();
        Ok(results)
    }
}
