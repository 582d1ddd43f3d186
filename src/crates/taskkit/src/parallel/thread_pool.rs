//! Shared-memory pool backed by rayon

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use tracing::debug;

use super::progress::Progress;
use super::Collector;
use crate::error::{ExecError, Result, TaskFailure};
use crate::task::Task;

/// Message from a pool thread: the input index and its outcome, or `None`
/// when the task was skipped after the map failed
type Completion<T> = (usize, Option<Result<T>>);

/// Run `task` over `inputs` on a pool of `num_workers` threads
///
/// Inputs are pulled lazily and dispatched FIFO, with at most twice the pool
/// size queued or running at once. Once a task fails, no further inputs are
/// pulled, queued tasks are skipped, and running ones are waited for.
pub(super) fn map<I, T>(
    inputs: I,
    task: Arc<T>,
    num_workers: usize,
    progress: Progress,
) -> Result<Vec<T::Output>>
where
    I: Iterator,
    I::Item: Send + 'static,
    T: Task<I::Item> + 'static,
    T::Output: Send + 'static,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_workers)
        .thread_name(|i| format!("taskkit-worker-{i}"))
        .build()
        .map_err(|e| ExecError::pool(format!("failed to build thread pool: {e}")))?;

    let window = num_workers.saturating_mul(2);
    let cancelled = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel::<Completion<T::Output>>();
    let mut collector = Collector::new(progress);
    let mut in_flight = 0usize;

    for args in inputs {
        if collector.failed() {
            break;
        }
        while in_flight >= window {
            receive(&rx, &mut collector)?;
            in_flight -= 1;
        }
        if collector.failed() {
            break;
        }

        let index = collector.reserve();
        let task = task.clone();
        let cancelled = cancelled.clone();
        let tx = tx.clone();
        pool.spawn_fifo(move || {
            if cancelled.load(Ordering::SeqCst) {
                let _ = tx.send((index, None));
                return;
            }

            let result = panic::catch_unwind(AssertUnwindSafe(|| task.run(args)))
                .unwrap_or_else(|payload| {
                    Err(TaskFailure::from_panic(task.name(), payload).into())
                });
            if result.is_err() {
                cancelled.store(true, Ordering::SeqCst);
            }
            // The collector only hangs up after every message it waits for
            let _ = tx.send((index, Some(result)));
        });
        in_flight += 1;
    }
    drop(tx);

    while in_flight > 0 {
        receive(&rx, &mut collector)?;
        in_flight -= 1;
    }

    debug!(
        workers = num_workers,
        failed = collector.failed(),
        "Thread pool drained"
    );
    collector.finish()
}

fn receive<T>(rx: &mpsc::Receiver<Completion<T>>, collector: &mut Collector<T>) -> Result<()> {
    let (index, outcome) = rx
        .recv()
        .map_err(|_| ExecError::pool("pool thread exited without reporting"))?;
    if let Some(result) = outcome {
        collector.record(index, result);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::task;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    fn quiet() -> Progress {
        Progress::new(false, None, None)
    }

    #[test]
    fn test_results_in_input_order() {
        // Later inputs finish first
        let t = task(|x: u64| {
            thread::sleep(Duration::from_millis(20 - x * 2));
            Ok::<_, String>(x)
        });

        let out = map(0..10u64, Arc::new(t), 4, quiet()).unwrap();
        assert_eq!(out, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_runs_on_named_pool_threads() {
        let names = Arc::new(Mutex::new(HashSet::new()));
        let sink = names.clone();
        let t = task(move |_: u32| {
            let name = thread::current().name().unwrap_or_default().to_string();
            sink.lock().unwrap().insert(name);
            thread::sleep(Duration::from_millis(5));
            Ok::<_, String>(())
        });

        map(0..16u32, Arc::new(t), 3, quiet()).unwrap();

        let names = names.lock().unwrap();
        assert!(!names.is_empty() && names.len() <= 3);
        assert!(names.iter().all(|n| n.starts_with("taskkit-worker-")));
    }

    #[test]
    fn test_concurrency_bounded_by_workers() {
        let active = Arc::new(Mutex::new((0usize, 0usize)));
        let gauge = active.clone();
        let t = task(move |_: u32| {
            {
                let mut g = gauge.lock().unwrap();
                g.0 += 1;
                g.1 = g.1.max(g.0);
            }
            thread::sleep(Duration::from_millis(10));
            gauge.lock().unwrap().0 -= 1;
            Ok::<_, String>(())
        });

        map(0..24u32, Arc::new(t), 4, quiet()).unwrap();
        let peak = active.lock().unwrap().1;
        assert!(peak <= 4, "peak concurrency {peak}");
    }

    #[test]
    fn test_panic_becomes_aggregation_failure() {
        let t = task(|x: i32| {
            if x == 3 {
                panic!("bad input {x}");
            }
            Ok::<_, String>(x)
        });

        let err = map(0..8, Arc::new(t), 2, quiet()).unwrap_err();
        match &err {
            ExecError::Aggregation { index, .. } => assert_eq!(*index, 3),
            other => panic!("expected aggregation failure, got {other:?}"),
        }
        assert!(err
            .task_failure()
            .unwrap()
            .cause()
            .to_string()
            .contains("bad input 3"));
    }

    #[test]
    fn test_stops_pulling_inputs_after_failure() {
        let pulled = Arc::new(Mutex::new(0usize));
        let counter = pulled.clone();
        let inputs = (0..1000).inspect(move |_| *counter.lock().unwrap() += 1);
        let t = task(|x: i32| {
            if x == 0 {
                Err("first input fails".to_string())
            } else {
                thread::sleep(Duration::from_millis(5));
                Ok(x)
            }
        });

        assert!(map(inputs, Arc::new(t), 2, quiet()).is_err());
        assert!(*pulled.lock().unwrap() < 1000);
    }
}
