//! Statistics for transform stages and processor runs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tp_error::{ErrorCategory, ErrorKind};

/// Counters updated by a stage from many threads at once.
#[derive(Debug, Default)]
pub struct StageStats {
    /// Messages transformed successfully
    succeeded: AtomicU64,

    compile_errors: AtomicU64,
    runtime_errors: AtomicU64,
    type_mismatches: AtomicU64,
    timeouts: AtomicU64,
    config_errors: AtomicU64,

    /// Total time spent in successful and failed evaluations
    eval_nanos: AtomicU64,
}

impl StageStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transformed message.
    pub fn record_success(&self, elapsed: std::time::Duration) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.record_elapsed(elapsed);
    }

    /// Record a failed message.
    pub fn record_failure(&self, kind: ErrorKind, elapsed: std::time::Duration) {
        let counter = match kind {
            ErrorKind::Compile => &self.compile_errors,
            ErrorKind::Runtime => &self.runtime_errors,
            ErrorKind::TypeMismatch => &self.type_mismatches,
            ErrorKind::Timeout => &self.timeouts,
            ErrorKind::Config => &self.config_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.record_elapsed(elapsed);
    }

    fn record_elapsed(&self, elapsed: std::time::Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.eval_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Create a snapshot of the current statistics.
    pub fn snapshot(&self) -> StageStatsSnapshot {
        StageStatsSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            compile_errors: self.compile_errors.load(Ordering::Relaxed),
            runtime_errors: self.runtime_errors.load(Ordering::Relaxed),
            type_mismatches: self.type_mismatches.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            config_errors: self.config_errors.load(Ordering::Relaxed),
            eval_nanos: self.eval_nanos.load(Ordering::Relaxed),
        }
    }
}

/// A serializable snapshot of stage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatsSnapshot {
    pub succeeded: u64,
    pub compile_errors: u64,
    pub runtime_errors: u64,
    pub type_mismatches: u64,
    pub timeouts: u64,
    pub config_errors: u64,
    pub eval_nanos: u64,
}

impl StageStatsSnapshot {
    /// Total number of failed messages.
    pub fn failed(&self) -> u64 {
        self.compile_errors
            + self.runtime_errors
            + self.type_mismatches
            + self.timeouts
            + self.config_errors
    }

    /// Total number of processed messages.
    pub fn processed(&self) -> u64 {
        self.succeeded + self.failed()
    }

    /// Mean evaluation time in microseconds.
    pub fn mean_eval_micros(&self) -> Option<f64> {
        let processed = self.processed();
        (processed > 0).then(|| self.eval_nanos as f64 / processed as f64 / 1000.0)
    }
}

/// Outcome of a [`Processor`](crate::Processor) run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Messages pulled from the source
    pub received: u64,

    /// Messages delivered to the sink
    pub emitted: u64,

    /// Messages handed to the failure sink
    pub failed: u64,

    /// Failures caused by the per-message timeout
    pub timed_out: u64,

    /// Failures worth retrying
    pub transient_errors: u64,

    /// Failures that will not succeed on retry
    pub permanent_errors: u64,
}

impl ProcessorStats {
    /// Create stats with the current time as start time.
    pub fn new() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Mark the run as complete with the current time.
    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    /// Record a failure of the given category.
    pub fn record_failure(&mut self, category: ErrorCategory) {
        self.failed += 1;
        match category {
            ErrorCategory::Transient => self.transient_errors += 1,
            ErrorCategory::Permanent => self.permanent_errors += 1,
        }
    }

    /// Get the total duration of the run.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            (Some(start), None) => Some(Utc::now() - start),
            _ => None,
        }
    }

    /// Calculate the throughput in messages per second.
    pub fn messages_per_second(&self) -> Option<f64> {
        self.duration().map(|d| {
            let secs = d.num_milliseconds() as f64 / 1000.0;
            if secs > 0.0 {
                self.received as f64 / secs
            } else {
                0.0
            }
        })
    }
}
