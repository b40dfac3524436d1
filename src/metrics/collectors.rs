//! Recording helpers over the raw Prometheus metrics.
//!
//! Recording is a no-op until `init_metrics()` has run, so library code can
//! record unconditionally and tests need no setup.

use super::prometheus::{
    ITERATIONS_COMPLETED, JOBS_FAILED_TOTAL, JOBS_IN_PROGRESS, JOBS_SUBMITTED_TOTAL,
    JOB_ATTEMPTS_TOTAL, STAGE_DURATION,
};

/// How a single job attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Failed, and another attempt was submitted.
    Retried,
    /// Failed with no attempts left.
    Failed,
}

impl AttemptOutcome {
    fn label(self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::Retried => "retried",
            AttemptOutcome::Failed => "failed",
        }
    }
}

/// One attempt counted in the in-progress gauge.
#[derive(Debug)]
pub struct InFlightJob {
    counted: bool,
}

impl Drop for InFlightJob {
    fn drop(&mut self) {
        if !self.counted {
            return;
        }
        if let Some(in_progress) = JOBS_IN_PROGRESS.get() {
            in_progress.dec();
        }
    }
}

/// Metrics collector for recording orchestrator metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one submission to an executor.
    ///
    /// The job counts as in progress until the returned guard is dropped.
    #[must_use = "the job stops counting as in progress when the guard is dropped"]
    pub fn record_job_submitted(&self) -> InFlightJob {
        if let Some(submitted) = JOBS_SUBMITTED_TOTAL.get() {
            submitted.inc();
        }
        let counted = match JOBS_IN_PROGRESS.get() {
            Some(in_progress) => {
                in_progress.inc();
                true
            }
            None => false,
        };
        InFlightJob { counted }
    }

    /// Record the end of one attempt.
    pub fn record_job_attempt(&self, outcome: AttemptOutcome) {
        if let Some(attempts) = JOB_ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[outcome.label()]).inc();
        }
        if outcome == AttemptOutcome::Failed {
            if let Some(failed) = JOBS_FAILED_TOTAL.get() {
                failed.inc();
            }
        }

        tracing::trace!(outcome = outcome.label(), "Recorded job attempt");
    }

    /// Record how long a stage took, from dispatch to resolved output.
    pub fn record_stage(&self, stage: &str, duration_secs: f64) {
        if let Some(duration) = STAGE_DURATION.get() {
            duration.with_label_values(&[stage]).observe(duration_secs);
        }
    }

    pub fn set_iterations_completed(&self, count: usize) {
        if let Some(iterations) = ITERATIONS_COMPLETED.get() {
            iterations.set(count as f64);
        }
    }
}
