//! Jobs that can run in worker processes
//!
//! Closures cannot cross a process boundary, so process-mode maps run a
//! [`Job`]: a named task whose input and output are serde types. A host
//! program registers the jobs it can serve and hands control to
//! [`serve_if_requested`] at the top of `main`. When the parallel mapper
//! starts that program as a worker it sets [`WORKER_ENV`] to the job name,
//! and the worker answers requests until its stdin closes.
//!
//! The wire format is one JSON object per line:
//!
//! ```text
//! -> {"id":3,"input":21}
//! <- {"id":3,"outcome":{"ok":42}}
//! <- {"id":4,"outcome":{"err":{"message":"division by zero","chain":[]}}}
//! ```
//!
//! Stdout carries protocol lines only; worker logs belong on stderr.
//!
//! # Example
//!
//! ```rust,no_run
//! use taskkit::jobs::Double;
//! use taskkit::worker::{serve_if_requested, JobRegistry};
//! use taskkit::{parallel_map_job, MapOptions, Mode};
//!
//! fn main() -> taskkit::Result<()> {
//!     let registry = JobRegistry::new().register(Double);
//!     if serve_if_requested(&registry)? {
//!         return Ok(());
//!     }
//!
//!     let options = MapOptions::new().with_mode(Mode::Process).with_num_workers(4);
//!     let doubled = parallel_map_job(0..100, Double, &options)?;
//!     assert_eq!(doubled[99], 198);
//!     Ok(())
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::error::{panic_message, BoxError, ExecError, RemoteError, Result, TaskFailure};
use crate::task::{Named, Task};

/// Environment variable naming the job a worker process should serve
pub const WORKER_ENV: &str = "TASKKIT_WORKER_JOB";

/// A named task that can run in a worker process
pub trait Job: Send + Sync {
    /// Registry key; must be unique within a program
    const NAME: &'static str;

    type Input: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    fn run(&self, input: Self::Input) -> std::result::Result<Self::Output, BoxError>;
}

/// A job used as an in-process [`Task`]
pub(crate) struct JobTask<J>(pub(crate) J);

impl<J: Job> Named for JobTask<J> {
    fn name(&self) -> &str {
        J::NAME
    }
}

impl<J: Job> Task<J::Input> for JobTask<J> {
    type Output = J::Output;

    fn run(&self, input: J::Input) -> Result<J::Output> {
        self.0
            .run(input)
            .map_err(|e| TaskFailure::new(J::NAME, e).into())
    }
}

type Handler = Box<dyn Fn(Value) -> std::result::Result<Value, BoxError> + Send + Sync>;

/// Jobs a program can serve as a worker, keyed by [`Job::NAME`]
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<&'static str, Handler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job; a later registration under the same name replaces it
    pub fn register<J: Job + 'static>(mut self, job: J) -> Self {
        let handler = move |value: Value| -> std::result::Result<Value, BoxError> {
            let input: J::Input = serde_json::from_value(value)?;
            let output = job.run(input)?;
            Ok(serde_json::to_value(output)?)
        };
        self.handlers.insert(J::NAME, Box::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered job names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.names())
            .finish()
    }
}

/// Request sent to a worker
#[derive(Debug, Serialize)]
pub(crate) struct Request<'a, T> {
    pub id: usize,
    pub input: &'a T,
}

/// Request as seen by the worker, before the input type is known
#[derive(Debug, Deserialize)]
struct RawRequest {
    id: usize,
    input: Value,
}

/// Reply to one request
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Response {
    pub id: usize,
    pub outcome: Outcome,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Outcome {
    Ok(Value),
    Err(WireError),
}

/// An error flattened to its messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireError {
    pub message: String,
    #[serde(default)]
    pub chain: Vec<String>,
}

impl WireError {
    fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut current = err.source();
        while let Some(cause) = current {
            chain.push(cause.to_string());
            current = cause.source();
        }
        Self {
            message: err.to_string(),
            chain,
        }
    }
}

impl From<WireError> for RemoteError {
    fn from(err: WireError) -> Self {
        RemoteError {
            message: err.message,
            chain: err.chain,
        }
    }
}

/// Serve the job named in [`WORKER_ENV`] if this process was started as a
/// worker
///
/// Returns `Ok(true)` after stdin closes, or `Ok(false)` immediately when the
/// variable is not set, in which case the program should carry on normally.
pub fn serve_if_requested(registry: &JobRegistry) -> Result<bool> {
    let job = match std::env::var(WORKER_ENV) {
        Ok(job) => job,
        Err(_) => return Ok(false),
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(registry, &job, stdin.lock(), stdout.lock())?;
    Ok(true)
}

/// Refuse to start a process pool from inside a worker process
///
/// A worker whose program never calls [`serve_if_requested`] would otherwise
/// rerun the host's `main` and spawn workers of its own.
pub(crate) fn ensure_not_worker() -> Result<()> {
    reject_nested_pool(std::env::var_os(WORKER_ENV))
}

fn reject_nested_pool(worker_job: Option<std::ffi::OsString>) -> Result<()> {
    match worker_job {
        Some(job) => Err(ConfigError::invalid(
            "mode",
            format!(
                "process mode is unavailable inside a worker process ({WORKER_ENV}={}); \
                 the worker program must call serve_if_requested at startup",
                job.to_string_lossy()
            ),
        )
        .into()),
        None => Ok(()),
    }
}

/// Answer requests for `job` read from `input` until EOF, returning how many
/// were served
///
/// Task errors and panics are sent back as `err` outcomes. A malformed
/// request line or a failed write ends the loop with an error.
pub fn serve<R, W>(registry: &JobRegistry, job: &str, input: R, mut output: W) -> Result<usize>
where
    R: BufRead,
    W: Write,
{
    let handler = registry.get(job).ok_or_else(|| {
        ExecError::pool(format!(
            "job `{job}` is not registered (known jobs: {})",
            registry.names().join(", ")
        ))
    })?;

    info!(job = %job, pid = std::process::id(), "Worker serving");
    let mut served = 0;

    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let RawRequest { id, input } = serde_json::from_str(&line)?;
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| handler(input))) {
            Ok(Ok(value)) => Outcome::Ok(value),
            Ok(Err(err)) => {
                debug!(job = %job, id, error = %err, "Job failed");
                Outcome::Err(WireError::from_error(err.as_ref()))
            }
            Err(payload) => {
                let message = format!("panicked: {}", panic_message(payload.as_ref()));
                warn!(job = %job, id, "Job {}", message);
                Outcome::Err(WireError {
                    message,
                    chain: Vec::new(),
                })
            }
        };

        let response = Response { id, outcome };
        serde_json::to_writer(&mut output, &response)?;
        output.write_all(b"\n")?;
        output.flush()?;
        served += 1;
    }

    info!(job = %job, served, "Worker input closed");
    Ok(served)
}
