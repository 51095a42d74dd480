//! Fixed-pool, static-partition parallel sample executor.
//!
//! `[0, N)` is split into one contiguous range per worker. Each worker owns
//! its output buffer and, when needed, its simulator session; the buffers
//! are copied into the combined result by index range after every worker
//! has been joined.

use std::any::Any;
use std::ops::Range;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sg_compute::{ExternalComputeSession, SimulatorLauncher};
use sg_data::ParameterCatalog;
use sg_types::{internal_error, secs_to_duration, DatasetError, GeneratorConfig, SessionConfig, SgError, SgResult};

use crate::graph::{DatasetInputs, SampleContext, SampleFn};
use crate::notify::{Notifier, StatusReport};
use crate::progress::{ProgressReporter, ProgressSnapshot, WorkerState};

/// Longest time the orchestrator sleeps between liveness checks.
const POLL_TICK: Duration = Duration::from_millis(50);

/// Shared cooperative cancellation flag, checked before every sample.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Periodic checkpoint callback. Failures are logged and ignored.
pub type CheckpointFn = Arc<dyn Fn(&ProgressSnapshot) -> SgResult<()> + Send + Sync>;

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub num_threads: usize,
    /// Upper bound on workers; defaults to the available CPU count.
    pub max_cpus: usize,
    pub max_consecutive_failures: usize,
    pub progress_interval: Duration,
    /// `None` disables checkpoints.
    pub checkpoint_interval: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_threads: 4,
            max_cpus: available_cpus(),
            max_consecutive_failures: 2,
            progress_interval: Duration::from_secs(10),
            checkpoint_interval: None,
        }
    }
}

impl ExecutorConfig {
    pub fn from_generator_config(config: &GeneratorConfig) -> Self {
        Self {
            num_threads: config.num_threads,
            max_cpus: available_cpus(),
            max_consecutive_failures: config.max_consecutive_failures,
            progress_interval: secs_to_duration(config.progress_report_interval_secs),
            checkpoint_interval: (config.checkpoint_interval_secs > 0.0)
                .then(|| secs_to_duration(config.checkpoint_interval_secs)),
        }
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_max_cpus(mut self, max_cpus: usize) -> Self {
        self.max_cpus = max_cpus;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// `max(1, min(threads, cpus, num_samples))`.
    pub fn worker_count(&self, num_samples: usize) -> usize {
        self.num_threads.min(self.max_cpus).min(num_samples).max(1)
    }
}

pub fn available_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Contiguous ranges covering `[0, num_samples)`; the last range takes the
/// remainder.
pub fn partition(num_samples: usize, num_workers: usize) -> Vec<Range<usize>> {
    let num_workers = num_workers.max(1);
    let per_worker = num_samples / num_workers;
    (0..num_workers)
        .map(|i| {
            let start = i * per_worker;
            let end = if i + 1 == num_workers {
                num_samples
            } else {
                start + per_worker
            };
            start..end
        })
        .collect()
}

/// One per-sample dataset to generate.
pub struct SampleJob<'a> {
    pub dataset: &'a str,
    pub num_samples: usize,
    pub width: usize,
    pub needs_external_compute: bool,
    pub generator: &'a SampleFn,
    pub catalog: &'a ParameterCatalog,
    pub config: &'a GeneratorConfig,
    pub inputs: &'a DatasetInputs<'a>,
}

/// Per-worker outcome.
#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub worker_id: usize,
    pub range: Range<usize>,
    pub completed: usize,
    pub errors: usize,
    pub aborted: bool,
    pub sample_time: Duration,
}

/// Combined result of a parallel run.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    /// Row-major `num_samples x width`, ordered by global sample index.
    pub values: Vec<f64>,
    pub error_count: usize,
    pub workers: Vec<WorkerSummary>,
}

impl SampleBatch {
    pub fn sample_time(&self) -> Duration {
        self.workers.iter().map(|w| w.sample_time).sum()
    }
}

/// Runs per-sample generators across a fixed worker pool.
pub struct ParallelSampleGenerator {
    config: ExecutorConfig,
    session_config: SessionConfig,
    launcher: Option<Arc<dyn SimulatorLauncher>>,
    cancel: CancelFlag,
    checkpoint: Option<CheckpointFn>,
}

impl std::fmt::Debug for ParallelSampleGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelSampleGenerator")
            .field("config", &self.config)
            .field("has_launcher", &self.launcher.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ParallelSampleGenerator {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            session_config: SessionConfig::default(),
            launcher: None,
            cancel: CancelFlag::new(),
            checkpoint: None,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn SimulatorLauncher>, session_config: SessionConfig) -> Self {
        self.launcher = Some(launcher);
        self.session_config = session_config;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointFn) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Generate every sample of `job`, reporting progress through `notifier`.
    ///
    /// Per-sample failures leave NaN rows and are counted; only
    /// cancellation fails the run.
    pub fn run(&self, job: &SampleJob<'_>, notifier: &mut Notifier) -> SgResult<SampleBatch> {
        let num_workers = self.config.worker_count(job.num_samples);
        let workers: Vec<WorkerState> = partition(job.num_samples, num_workers)
            .into_iter()
            .enumerate()
            .map(|(id, range)| WorkerState::new(id, range))
            .collect();

        tracing::info!(
            "[{}]: generating {} samples on {} workers",
            job.dataset,
            job.num_samples,
            num_workers
        );

        let mut reporter = ProgressReporter::new(job.dataset, job.num_samples);
        let buffers = std::thread::scope(|scope| {
            let handles: Vec<_> = workers
                .iter()
                .map(|state| {
                    std::thread::Builder::new()
                        .name(format!("{}-worker-{}", job.dataset, state.worker_id))
                        .spawn_scoped(scope, move || self.run_worker(state, job))
                })
                .collect::<Result<_, _>>()?;

            let mut last_report = Instant::now();
            let mut last_checkpoint = Instant::now();
            loop {
                let alive: Vec<bool> = handles.iter().map(|h| !h.is_finished()).collect();
                let any_alive = alive.iter().any(|a| *a);
                let now = Instant::now();

                let report_due = now.duration_since(last_report) >= self.config.progress_interval;
                if report_due || !any_alive {
                    last_report = now;
                    let snapshot = reporter.sample(&workers, &alive);
                    if snapshot.all_initialized() || !any_alive {
                        let delta = reporter.take_delta(&snapshot);
                        reporter.log(&snapshot, delta);
                        notifier.maybe_notify(&StatusReport::from_snapshot(&snapshot));
                    }
                }

                let mut next_wake = self.config.progress_interval.saturating_sub(now.duration_since(last_report));
                if let (Some(checkpoint), Some(interval)) = (&self.checkpoint, self.config.checkpoint_interval) {
                    if any_alive && now.duration_since(last_checkpoint) >= interval {
                        last_checkpoint = now;
                        if let Err(e) = checkpoint(&reporter.sample(&workers, &alive)) {
                            tracing::warn!("[{}]: checkpoint failed: {}", job.dataset, e);
                        }
                    }
                    next_wake = next_wake.min(interval.saturating_sub(now.duration_since(last_checkpoint)));
                }

                if !any_alive {
                    break;
                }

                std::thread::sleep(next_wake.clamp(Duration::from_millis(1), POLL_TICK));
            }

            let buffers: Vec<Vec<f64>> = handles
                .into_iter()
                .zip(&workers)
                .map(|(handle, state)| match handle.join() {
                    Ok(buffer) => buffer,
                    Err(_) => {
                        tracing::error!(worker_id = state.worker_id, "Worker thread panicked");
                        vec![f64::NAN; state.len() * job.width]
                    }
                })
                .collect();
            Ok::<_, SgError>(buffers)
        })?;

        if self.cancel.is_cancelled() {
            tracing::warn!("[{}]: generation cancelled", job.dataset);
            return Err(SgError::Cancelled);
        }

        let mut values = vec![f64::NAN; job.num_samples * job.width];
        for (state, buffer) in workers.iter().zip(&buffers) {
            let start = state.range.start * job.width;
            values[start..start + buffer.len()].copy_from_slice(buffer);
        }

        let summaries: Vec<WorkerSummary> = workers
            .iter()
            .map(|w| WorkerSummary {
                worker_id: w.worker_id,
                range: w.range.clone(),
                completed: w.progress(),
                errors: w.errors(),
                aborted: w.is_aborted(),
                sample_time: w.sample_time(),
            })
            .collect();
        let error_count = summaries.iter().map(|w| w.errors).sum();
        tracing::info!("[{}]: generation finished; total errors: {}", job.dataset, error_count);

        Ok(SampleBatch {
            values,
            error_count,
            workers: summaries,
        })
    }

    fn run_worker(&self, state: &WorkerState, job: &SampleJob<'_>) -> Vec<f64> {
        let buffer = self.fill_partition(state, job);
        state.mark_finished();
        tracing::info!(
            worker_id = state.worker_id,
            "Worker finished; error count: {}",
            state.errors()
        );
        buffer
    }

    fn fill_partition(&self, state: &WorkerState, job: &SampleJob<'_>) -> Vec<f64> {
        let width = job.width;
        let mut buffer = vec![f64::NAN; state.len() * width];

        let mut session = if job.needs_external_compute {
            match self.start_session(state.worker_id, job.dataset) {
                Ok(session) => Some(session),
                Err(e) => {
                    tracing::error!(
                        worker_id = state.worker_id,
                        "Unable to start simulator; partition {:?} stays empty: {}",
                        state.range,
                        e
                    );
                    state.mark_aborted();
                    state.mark_initialized();
                    return buffer;
                }
            }
        } else {
            None
        };
        state.mark_initialized();

        let mut consecutive_failures = 0;
        for (local_index, sample_index) in state.range.clone().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::debug!(worker_id = state.worker_id, "Cancelled at sample #{}", sample_index);
                break;
            }

            let started = Instant::now();
            if let Some(session) = session.as_mut() {
                if let Err(e) = session.restart_if_dead() {
                    tracing::error!(
                        worker_id = state.worker_id,
                        "Simulator could not be restarted; abandoning partition at sample #{}: {}",
                        sample_index,
                        e
                    );
                    state.mark_aborted();
                    break;
                }
            }

            let mut ctx = SampleContext {
                dataset: job.dataset,
                worker_id: state.worker_id,
                sample_index,
                local_index,
                catalog: job.catalog,
                config: job.config,
                inputs: job.inputs,
                session: session.as_mut(),
            };
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| (job.generator)(&mut ctx)))
                .unwrap_or_else(|payload| Err(internal_error!("sample generator panicked: {}", panic_message(&*payload))))
                .and_then(|row| {
                    if row.len() == width {
                        Ok(row)
                    } else {
                        Err(DatasetError::WidthMismatch {
                            dataset: job.dataset.to_string(),
                            expected: width,
                            actual: row.len(),
                        }
                        .into())
                    }
                });

            match result {
                Ok(row) => {
                    buffer[local_index * width..(local_index + 1) * width].copy_from_slice(&row);
                    consecutive_failures = 0;
                }
                Err(e) => {
                    state.record_error();
                    consecutive_failures += 1;
                    tracing::warn!(
                        worker_id = state.worker_id,
                        sample = sample_index,
                        "Encountered error in sample #{}: {}",
                        sample_index,
                        e
                    );
                    tracing::debug!(
                        sample = sample_index,
                        "Input parameters: {}",
                        job.inputs.describe_row(sample_index)
                    );
                }
            }

            state.record_sample_time(started.elapsed());
            state.set_progress(local_index + 1);

            if consecutive_failures >= self.config.max_consecutive_failures {
                tracing::error!(
                    worker_id = state.worker_id,
                    "Unable to continue execution; erroneous sample: #{}",
                    sample_index
                );
                state.mark_aborted();
                break;
            }
        }

        if let Some(session) = session {
            session.shutdown();
        }
        buffer
    }

    fn start_session(&self, worker_id: usize, dataset: &str) -> SgResult<ExternalComputeSession> {
        let launcher = self
            .launcher
            .clone()
            .ok_or_else(|| DatasetError::NoSession { dataset: dataset.to_string() })?;
        ExternalComputeSession::start(worker_id, &self.session_config, launcher)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
