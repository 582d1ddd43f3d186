//! taskkit CLI - run the stock jobs through the parallel mapper
//!
//! The same executable doubles as the process-mode worker: when started with
//! `TASKKIT_WORKER_JOB` set it serves that job on stdin/stdout and exits.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use taskkit::config::{ExecutionConfig, DEFAULT_ENV_PREFIX};
use taskkit::jobs::{self, Divide, Double, Multiply, Nap};
use taskkit::task::{task, Single};
use taskkit::worker::serve_if_requested;
use taskkit::{parallel_map, parallel_map_job, Job, MapOptions, Mode, TaskExt, TimeoutGuard};

#[derive(Parser)]
#[command(name = "taskkit")]
#[command(about = "taskkit - retries, timeouts and parallel maps", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Map a stock job over generated inputs and print the results as JSON
    Map {
        /// Job to run
        #[arg(short, long, value_enum)]
        job: JobName,

        /// Number of inputs (0..count)
        #[arg(short, long, default_value_t = 100)]
        count: i64,

        /// Pool flavour: thread or process (default from config)
        #[arg(short, long)]
        mode: Option<Mode>,

        /// Pool size (default from config)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,

        /// YAML or JSON execution config; its retry and timeout settings
        /// wrap each call in thread mode
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum JobName {
    Double,
    Multiply,
    Divide,
    Nap,
}

fn init_tracing() {
    // Stdout is reserved for results and the worker protocol
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_job<J>(
    job: J,
    inputs: Vec<J::Input>,
    options: &MapOptions,
    config: &ExecutionConfig,
) -> anyhow::Result<()>
where
    J: Job + 'static,
    J::Input: Clone,
{
    let results = match options.mode {
        Mode::Thread => {
            let call = task::<_, Single>(move |input: J::Input| job.run(input)).with_name(J::NAME);
            let policy = config.retry_policy();
            match config.timeout() {
                Some(timeout) => {
                    let guard = TimeoutGuard::new()?;
                    let call = call.with_timeout(&guard, timeout).with_retry(policy);
                    parallel_map(inputs, call, options)
                }
                None => parallel_map(inputs, call.with_retry(policy), options),
            }
        }
        Mode::Process => parallel_map_job(inputs, job, options),
    };
    let results = results
        .map_err(|e| anyhow::anyhow!(taskkit::format_error_chain(&e)))
        .with_context(|| format!("`{}` map failed", J::NAME))?;
    println!("{}", serde_json::to_string(&results)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    if serve_if_requested(&jobs::registry()).context("worker failed")? {
        return Ok(());
    }

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Map {
            job,
            count,
            mode,
            workers,
            no_progress,
            config,
        }) => {
            let config = ExecutionConfig::load(config.as_deref(), DEFAULT_ENV_PREFIX)
                .context("invalid configuration")?;

            let mut options = config.map_options();
            if let Some(mode) = mode {
                options = options.with_mode(mode);
            }
            if let Some(workers) = workers {
                options = options.with_num_workers(workers);
            }
            if no_progress {
                options = options.with_progress(false);
            }

            let range = 0..count.max(0);
            match job {
                JobName::Double => run_job(Double, range.collect(), &options, &config)?,
                JobName::Multiply => run_job(
                    Multiply,
                    range.map(|x| (x, x)).collect(),
                    &options,
                    &config,
                )?,
                // Divisors count down to zero, so the last input fails
                JobName::Divide => run_job(
                    Divide,
                    range.map(|x| (x, count - 1 - x)).collect(),
                    &options,
                    &config,
                )?,
                JobName::Nap => run_job(
                    Nap,
                    range.map(|x| (x % 10) as u64).collect(),
                    &options,
                    &config,
                )?,
            }
        }
        Some(Commands::Version) => {
            println!("taskkit {}", taskkit::version());
        }
        None => {
            println!("taskkit {} - use --help for usage", taskkit::version());
        }
    }

    Ok(())
}
