//! Common test utilities and setup

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskkit::{MapOptions, Mode, RetryPolicy};

/// Map options without a progress bar
pub fn quiet_options(mode: Mode, workers: usize) -> MapOptions {
    MapOptions::new()
        .with_mode(mode)
        .with_num_workers(workers)
        .with_progress(false)
}

/// Process-mode options whose workers are the built `taskkit` binary
pub fn process_options(workers: usize) -> MapOptions {
    quiet_options(Mode::Process, workers).with_worker_program(worker_binary())
}

pub fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_taskkit"))
}

/// A retry policy that records its sleeps instead of sleeping
pub fn recording_policy(
    max_attempts: usize,
    initial_delay: f64,
    backoff_factor: f64,
) -> (RetryPolicy, Arc<Mutex<Vec<Duration>>>) {
    let slept = Arc::new(Mutex::new(Vec::new()));
    let sink = slept.clone();
    let policy = RetryPolicy::new(max_attempts)
        .with_initial_delay(initial_delay)
        .with_backoff_factor(backoff_factor)
        .with_sleeper(move |d| sink.lock().unwrap().push(d));
    (policy, slept)
}
