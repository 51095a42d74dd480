//! Progress snapshots, ETA estimation and human readable time formatting.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

/// Timestamp format used in status reports.
pub const DISPLAY_TIME_FORMAT: &str = "%Y. %m. %d. %H:%M:%S";

/// ETAs below this are reported as unknown.
const MIN_REPORTED_ETA_SECS: f64 = 1.1;

/// Shared per-worker counters.
///
/// Every field is written only by the owning worker thread; the
/// orchestrator only reads them.
#[derive(Debug)]
pub struct WorkerState {
    pub worker_id: usize,
    pub range: Range<usize>,
    progress: AtomicUsize,
    errors: AtomicUsize,
    initialized: AtomicBool,
    finished: AtomicBool,
    aborted: AtomicBool,
    sample_nanos: AtomicU64,
}

impl WorkerState {
    pub fn new(worker_id: usize, range: Range<usize>) -> Self {
        Self {
            worker_id,
            range,
            progress: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            sample_nanos: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn progress(&self) -> usize {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Accumulated wall time spent inside sample callbacks.
    pub fn sample_time(&self) -> Duration {
        Duration::from_nanos(self.sample_nanos.load(Ordering::Relaxed))
    }

    pub(crate) fn set_progress(&self, done: usize) {
        self.progress.store(done, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sample_time(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.sample_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    pub(crate) fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

/// Point-in-time view of a running dataset generation.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub dataset: String,
    pub total_samples: usize,
    pub total_done: usize,
    pub total_errors: usize,
    pub per_worker_done: Vec<usize>,
    pub alive_count: usize,
    pub num_workers: usize,
    pub initialized_count: usize,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    /// `None` while the slowest running worker has not finished a sample.
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn all_initialized(&self) -> bool {
        self.initialized_count == self.num_workers
    }

    pub fn eta_text(&self) -> String {
        format_eta(self.eta)
    }

    pub fn finish_time_text(&self) -> String {
        match self.eta {
            Some(eta) if eta.as_secs_f64() >= MIN_REPORTED_ETA_SECS => {
                let finish = Local::now() + chrono::Duration::from_std(eta).unwrap_or(chrono::Duration::zero());
                format_timestamp(&finish)
            }
            _ => "unknown".to_string(),
        }
    }

    /// Ordered key/value status fields.
    pub fn status_fields(&self) -> Vec<(String, String)> {
        vec![
            ("Dataset".to_string(), self.dataset.clone()),
            (
                "Samples".to_string(),
                format!("{}/{}", group_digits(self.total_done), group_digits(self.total_samples)),
            ),
            (
                "Alive workers".to_string(),
                format!("{}/{}", self.alive_count, self.num_workers),
            ),
            ("Errors".to_string(), group_digits(self.total_errors)),
            ("Start time".to_string(), format_timestamp(&self.started_at)),
            ("Current time".to_string(), format_timestamp(&Local::now())),
            ("Total elapsed time".to_string(), precise_delta(self.elapsed, TimeUnit::Seconds)),
            ("Estimated time left".to_string(), self.eta_text()),
        ]
    }
}

/// Builds [`ProgressSnapshot`]s from worker counters.
#[derive(Debug)]
pub struct ProgressReporter {
    dataset: String,
    total_samples: usize,
    started_at: DateTime<Local>,
    /// Set once every worker has initialized; ETA is measured from here.
    measuring_since: Option<Instant>,
    last_total: usize,
}

impl ProgressReporter {
    pub fn new(dataset: &str, total_samples: usize) -> Self {
        Self {
            dataset: dataset.to_string(),
            total_samples,
            started_at: Local::now(),
            measuring_since: None,
            last_total: 0,
        }
    }

    /// Read every worker's counters. `alive` flags which worker threads are
    /// still running.
    pub fn sample(&mut self, workers: &[WorkerState], alive: &[bool]) -> ProgressSnapshot {
        let initialized_count = workers.iter().filter(|w| w.is_initialized()).count();
        if self.measuring_since.is_none() && initialized_count == workers.len() {
            self.measuring_since = Some(Instant::now());
        }
        let elapsed = self.measuring_since.map_or(Duration::ZERO, |t| t.elapsed());

        let per_worker_done: Vec<usize> = workers.iter().map(WorkerState::progress).collect();
        let total_done = per_worker_done.iter().sum();
        let total_errors = workers.iter().map(WorkerState::errors).sum();
        let alive_count = alive.iter().filter(|a| **a).count();

        // slowest worker among those still running
        let slowest = workers
            .iter()
            .zip(alive)
            .filter(|(w, alive)| **alive && !w.is_finished())
            .map(|(w, _)| (w.progress(), w.len()))
            .min_by_key(|(done, len)| (*done, std::cmp::Reverse(*len)));

        let eta = match slowest {
            None => Some(Duration::ZERO),
            Some((done, len)) => estimate_eta(done, len, elapsed),
        };

        ProgressSnapshot {
            dataset: self.dataset.clone(),
            total_samples: self.total_samples,
            total_done,
            total_errors,
            per_worker_done,
            alive_count,
            num_workers: workers.len(),
            initialized_count,
            started_at: self.started_at,
            elapsed,
            eta,
        }
    }

    /// Log one progress line; per-worker detail at debug level.
    pub fn log(&self, snapshot: &ProgressSnapshot, delta: usize) {
        if snapshot.all_initialized() {
            for (worker_id, done) in snapshot.per_worker_done.iter().enumerate() {
                tracing::debug!(worker_id, "Worker progress: {}", group_digits(*done));
            }
        }

        tracing::info!(
            "[{}]: {}/{} samples finished. Delta: {}. Workers running: {}/{}. Errors: {}. Est. finish time: {} ({})",
            snapshot.dataset,
            group_digits(snapshot.total_done),
            group_digits(snapshot.total_samples),
            group_digits(delta),
            snapshot.alive_count,
            snapshot.num_workers,
            snapshot.total_errors,
            snapshot.finish_time_text(),
            snapshot.eta_text()
        );
    }

    /// Samples finished since the previous call.
    pub fn take_delta(&mut self, snapshot: &ProgressSnapshot) -> usize {
        let delta = snapshot.total_done.saturating_sub(self.last_total);
        self.last_total = snapshot.total_done;
        delta
    }
}

/// `(len - done) * elapsed / done`; undefined until a sample has finished.
pub fn estimate_eta(done: usize, len: usize, elapsed: Duration) -> Option<Duration> {
    if done == 0 {
        return None;
    }
    let per_sample = elapsed.as_secs_f64() / done as f64;
    Duration::try_from_secs_f64(len.saturating_sub(done) as f64 * per_sample).ok()
}

pub fn format_timestamp(time: &DateTime<Local>) -> String {
    time.format(DISPLAY_TIME_FORMAT).to_string()
}

/// Remaining-time text: seconds are dropped above a minute, minutes above
/// an hour.
pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(eta) if eta.as_secs_f64() >= MIN_REPORTED_ETA_SECS => {
            let secs = eta.as_secs_f64();
            let unit = if secs < 60.0 {
                TimeUnit::Seconds
            } else if secs < 3600.0 {
                TimeUnit::Minutes
            } else {
                TimeUnit::Hours
            };
            precise_delta(eta, unit)
        }
        _ => "unknown".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    fn secs(self) -> f64 {
        match self {
            Self::Seconds => 1.0,
            Self::Minutes => 60.0,
            Self::Hours => 3600.0,
            Self::Days => 86400.0,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Seconds => "second",
            Self::Minutes => "minute",
            Self::Hours => "hour",
            Self::Days => "day",
        }
    }
}

/// e.g. "1 day, 2 hours and 3.5 minutes". The smallest unit shown is
/// `min_unit`; it carries any remainder as a fraction.
pub fn precise_delta(duration: Duration, min_unit: TimeUnit) -> String {
    let mut remaining = duration.as_secs_f64();
    let mut parts = Vec::new();

    for unit in [TimeUnit::Days, TimeUnit::Hours, TimeUnit::Minutes, TimeUnit::Seconds] {
        if unit < min_unit {
            break;
        }
        if unit == min_unit {
            let value = remaining / unit.secs();
            let rounded = (value * 100.0).round() / 100.0;
            if rounded > 0.0 || parts.is_empty() {
                let text = if rounded.fract() == 0.0 {
                    format!("{rounded:.0}")
                } else {
                    format!("{rounded:.2}").trim_end_matches('0').to_string()
                };
                let plural = if rounded == 1.0 { "" } else { "s" };
                parts.push(format!("{} {}{}", text, unit.name(), plural));
            }
            break;
        }

        let whole = (remaining / unit.secs()).floor();
        if whole >= 1.0 {
            remaining -= whole * unit.secs();
            let plural = if whole == 1.0 { "" } else { "s" };
            parts.push(format!("{:.0} {}{}", whole, unit.name(), plural));
        }
    }

    match parts.len() {
        0 => "0 seconds".to_string(),
        1 => parts.remove(0),
        n => {
            let last = parts.remove(n - 1);
            format!("{} and {}", parts.join(", "), last)
        }
    }
}

/// Thousands separators, e.g. `12345` -> `12,345`.
pub fn group_digits(value: usize) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Binary-unit byte count, e.g. `1536` -> `1.50 KiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
