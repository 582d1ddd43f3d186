//! Isolated-memory pool of worker processes
//!
//! Each worker is a child process serving one job over JSON lines (see
//! [`crate::worker`]). A reader thread per child turns its stdout into events
//! on a shared channel, so the parent waits on a single receiver for whichever
//! worker answers first.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use super::progress::Progress;
use super::Collector;
use crate::error::{ExecError, RemoteError, Result, TaskFailure};
use crate::worker::{Job, Outcome, Request, Response, WORKER_ENV};

enum Event {
    Reply { worker: usize, response: Response },
    Lost { worker: usize, reason: String },
}

struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<()>>,
    /// Input index currently being served
    busy: Option<usize>,
    alive: bool,
}

struct ProcessPool {
    program: PathBuf,
    job: &'static str,
    capacity: usize,
    workers: Vec<WorkerProcess>,
    events_tx: mpsc::Sender<Event>,
    events: mpsc::Receiver<Event>,
}

impl ProcessPool {
    fn new(program: &Path, job: &'static str, capacity: usize) -> Self {
        let (events_tx, events) = mpsc::channel();
        Self {
            program: program.to_path_buf(),
            job,
            capacity,
            workers: Vec::new(),
            events_tx,
            events,
        }
    }

    fn alive(&self) -> usize {
        self.workers.iter().filter(|w| w.alive).count()
    }

    fn in_flight(&self) -> usize {
        self.workers.iter().filter(|w| w.busy.is_some()).count()
    }

    /// An idle worker, starting a new one while under capacity
    fn idle_worker(&mut self) -> Result<Option<usize>> {
        if let Some(id) = self
            .workers
            .iter()
            .position(|w| w.alive && w.busy.is_none())
        {
            return Ok(Some(id));
        }
        if self.alive() < self.capacity {
            return self.spawn().map(Some);
        }
        Ok(None)
    }

    fn spawn(&mut self) -> Result<usize> {
        let id = self.workers.len();
        let mut child = Command::new(&self.program)
            .env(WORKER_ENV, self.job)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                ExecError::pool(format!(
                    "failed to start worker {}: {e}",
                    self.program.display()
                ))
            })?;

        let Some(stdout) = child.stdout.take() else {
            discard(&mut child);
            return Err(ExecError::pool("worker stdout was not captured"));
        };
        let stdin = child.stdin.take();

        let events = self.events_tx.clone();
        let reader = match thread::Builder::new()
            .name(format!("taskkit-worker-reader-{id}"))
            .spawn(move || read_replies(id, stdout, events))
        {
            Ok(reader) => reader,
            Err(e) => {
                discard(&mut child);
                return Err(e.into());
            }
        };

        debug!(worker = id, pid = child.id(), job = self.job, "Started worker process");
        self.workers.push(WorkerProcess {
            child,
            stdin,
            reader: Some(reader),
            busy: None,
            alive: true,
        });
        Ok(id)
    }

    /// Send one request line to `worker` and mark it busy with `index`
    fn dispatch(&mut self, worker: usize, index: usize, line: &str) -> std::io::Result<()> {
        let slot = &mut self.workers[worker];
        let stdin = slot.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdin closed")
        })?;
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()?;
        slot.busy = Some(index);
        Ok(())
    }

    /// Wait for the next worker event and fold it into `collector`
    fn handle_event<J: Job>(&mut self, collector: &mut Collector<J::Output>) -> Result<()> {
        let event = self
            .events
            .recv()
            .map_err(|_| ExecError::pool("worker event channel closed"))?;

        match event {
            Event::Reply { worker, response } => {
                let slot = &mut self.workers[worker];
                match slot.busy.take() {
                    Some(index) if index == response.id => {
                        collector.record(index, decode::<J>(response.outcome));
                    }
                    Some(index) => {
                        slot.alive = false;
                        collector.fail(
                            index,
                            ExecError::pool(format!(
                                "worker {worker} answered request #{} while #{index} was in flight",
                                response.id
                            )),
                        );
                    }
                    None => {
                        slot.alive = false;
                        collector.fail(
                            response.id,
                            ExecError::pool(format!(
                                "worker {worker} answered request #{} it was never sent",
                                response.id
                            )),
                        );
                    }
                }
            }
            Event::Lost { worker, reason } => {
                let slot = &mut self.workers[worker];
                slot.alive = false;
                match slot.busy.take() {
                    Some(index) => collector.fail(
                        index,
                        ExecError::pool(format!(
                            "worker {worker} lost while running input #{index}: {reason}"
                        )),
                    ),
                    None => warn!(worker, reason = %reason, "Idle worker process exited"),
                }
            }
        }
        Ok(())
    }

    /// Stop every worker: close stdin so they exit on their own, or kill them
    fn shutdown(&mut self, kill: bool) {
        for (id, worker) in self.workers.iter_mut().enumerate() {
            worker.stdin.take();
            if kill {
                if let Err(e) = worker.child.kill() {
                    debug!(worker = id, error = %e, "Worker already exited");
                }
            }
            match worker.child.wait() {
                Ok(status) if !status.success() && !kill => {
                    warn!(worker = id, status = %status, "Worker exited abnormally");
                }
                Ok(_) => {}
                Err(e) => warn!(worker = id, error = %e, "Failed to reap worker"),
            }
            if let Some(reader) = worker.reader.take() {
                let _ = reader.join();
            }
            worker.alive = false;
        }
        self.workers.clear();
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

/// Kill and reap a child that never joined the pool
fn discard(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!(pid = child.id(), error = %e, "Worker already exited");
    }
    if let Err(e) = child.wait() {
        warn!(pid = child.id(), error = %e, "Failed to reap worker");
    }
}

fn read_replies(worker: usize, stdout: impl std::io::Read, events: mpsc::Sender<Event>) {
    let reader = BufReader::new(stdout);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                let _ = events.send(Event::Lost {
                    worker,
                    reason: format!("read error: {e}"),
                });
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Response>(&line) {
            Ok(response) => {
                if events.send(Event::Reply { worker, response }).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = events.send(Event::Lost {
                    worker,
                    reason: format!("malformed reply: {e}"),
                });
                return;
            }
        }
    }
    let _ = events.send(Event::Lost {
        worker,
        reason: "worker exited".to_string(),
    });
}

fn decode<J: Job>(outcome: Outcome) -> Result<J::Output> {
    match outcome {
        Outcome::Ok(value) => Ok(serde_json::from_value(value)?),
        Outcome::Err(err) => Err(TaskFailure::new(J::NAME, RemoteError::from(err)).into()),
    }
}

/// Run `J` over `inputs` in up to `num_workers` worker processes of `program`
///
/// Workers are started on demand, each with one request in flight. On the
/// first failure no further inputs are dispatched and every worker is killed.
pub(super) fn map<J, I>(
    inputs: I,
    program: &Path,
    num_workers: usize,
    progress: Progress,
) -> Result<Vec<J::Output>>
where
    J: Job,
    I: Iterator<Item = J::Input>,
{
    let mut pool = ProcessPool::new(program, J::NAME, num_workers);
    let mut collector = Collector::new(progress);

    for input in inputs {
        let worker = loop {
            if collector.failed() {
                break None;
            }
            if let Some(worker) = pool.idle_worker()? {
                break Some(worker);
            }
            pool.handle_event::<J>(&mut collector)?;
        };
        let Some(worker) = worker else {
            break;
        };

        let index = collector.reserve();
        let line = match serde_json::to_string(&Request { id: index, input: &input }) {
            Ok(line) => line,
            Err(e) => {
                collector.fail(index, e.into());
                break;
            }
        };
        if let Err(e) = pool.dispatch(worker, index, &line) {
            collector.fail(
                index,
                ExecError::pool(format!("failed to send input #{index} to worker {worker}: {e}")),
            );
            break;
        }
    }

    while !collector.failed() && pool.in_flight() > 0 {
        pool.handle_event::<J>(&mut collector)?;
    }

    let failed = collector.failed();
    debug!(
        job = J::NAME,
        workers = pool.workers.len(),
        failed,
        "Process pool finished"
    );
    pool.shutdown(failed);
    collector.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::Double;

    fn quiet() -> Progress {
        Progress::new(false, None, None)
    }

    #[cfg(unix)]
    #[test]
    fn test_discard_kills_and_reaps_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();

        discard(&mut child);

        let status = child.try_wait().unwrap().expect("child should be reaped");
        assert!(!status.success());
    }

    #[test]
    fn test_missing_program_is_pool_error() {
        let err = map::<Double, _>(
            0..3,
            Path::new("/nonexistent/taskkit-worker"),
            2,
            quiet(),
        )
        .unwrap_err();
        assert_eq!(err.error_code(), "E_POOL");
        assert!(err.to_string().contains("failed to start worker"));
    }

    #[test]
    fn test_empty_input_starts_no_workers() {
        let out = map::<Double, _>(
            std::iter::empty(),
            Path::new("/nonexistent/taskkit-worker"),
            4,
            quiet(),
        )
        .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_decode_remote_error() {
        let outcome: Outcome = serde_json::from_str(
            r#"{"err":{"message":"division by zero","chain":["dividend was 4"]}}"#,
        )
        .unwrap();
        let err = decode::<Double>(outcome).unwrap_err();
        let failure = err.task_failure().unwrap();
        assert_eq!(failure.name(), "double");
        assert_eq!(
            failure.downcast_ref::<RemoteError>().unwrap().chain,
            vec!["dividend was 4".to_string()]
        );
    }

    #[test]
    fn test_decode_wrong_output_type() {
        let outcome: Outcome = serde_json::from_str(r#"{"ok":"not a number"}"#).unwrap();
        let err = decode::<Double>(outcome).unwrap_err();
        assert_eq!(err.error_code(), "E_SERIALIZATION");
    }
}
