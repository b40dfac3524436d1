//! Retry combinator for submitted jobs.
//!
//! A [`RetryingJob`] owns everything needed to launch its work again: the
//! executor, the rendered script and the working directory. Completion is
//! judged by the policy's done check, not by process exit alone, and a job
//! that is not done is resubmitted until it runs out of attempts.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, warn};
use uuid::Uuid;

use super::{Job, JobOutcome};
use crate::error::{ExecutorError, JobError};
use crate::executor::Executor;
use crate::metrics::{AttemptOutcome, InFlightJob, MetricsCollector};

/// Default number of attempts per job.
pub const DEFAULT_MAX_TRIES: u32 = 2;

/// Predicate deciding whether a finished attempt counts as done.
pub type DoneCheck = Arc<dyn Fn(&JobOutcome) -> bool + Send + Sync>;

/// How many times a job may run and what counts as success.
#[derive(Clone)]
pub struct RetryPolicy {
    max_tries: u32,
    done_check: DoneCheck,
}

impl RetryPolicy {
    /// Policy allowing `max_tries` attempts (at least one), done on exit code 0.
    pub fn new(max_tries: u32) -> Self {
        Self {
            max_tries: max_tries.max(1),
            done_check: Arc::new(JobOutcome::exited_cleanly),
        }
    }

    /// Replaces the done check.
    pub fn with_done_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&JobOutcome) -> bool + Send + Sync + 'static,
    {
        self.done_check = Arc::new(check);
        self
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    pub fn is_done(&self, outcome: &JobOutcome) -> bool {
        (self.done_check)(outcome)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRIES)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_tries", &self.max_tries)
            .finish_non_exhaustive()
    }
}

/// A submitted job that resubmits itself until done or out of attempts.
pub struct RetryingJob {
    executor: Arc<dyn Executor>,
    script: String,
    cwd: PathBuf,
    policy: RetryPolicy,
    current: Job,
    in_flight: InFlightJob,
    attempt: u32,
}

impl RetryingJob {
    /// Submits the first attempt and returns without waiting for it.
    pub async fn start(
        executor: Arc<dyn Executor>,
        script: String,
        cwd: PathBuf,
        policy: RetryPolicy,
    ) -> Result<Self, ExecutorError> {
        let current = executor.submit(&script, &cwd).await?;
        let in_flight = MetricsCollector::new().record_job_submitted();
        Ok(Self {
            executor,
            script,
            cwd,
            policy,
            current,
            in_flight,
            attempt: 1,
        })
    }

    /// Id of the attempt currently running.
    pub fn id(&self) -> Uuid {
        self.current.id()
    }

    /// Waits until an attempt is done, resubmitting failed attempts.
    pub async fn wait(self) -> Result<JobOutcome, JobError> {
        let RetryingJob {
            executor,
            script,
            cwd,
            policy,
            mut current,
            mut in_flight,
            mut attempt,
        } = self;
        let metrics = MetricsCollector::new();

        loop {
            let job_id = current.id();
            let outcome = current.wait().await?;

            if policy.is_done(&outcome) {
                drop(in_flight);
                metrics.record_job_attempt(AttemptOutcome::Succeeded);
                return Ok(outcome);
            }

            if attempt >= policy.max_tries() {
                drop(in_flight);
                metrics.record_job_attempt(AttemptOutcome::Failed);
                error!(
                    job_id = %job_id,
                    cwd = %cwd.display(),
                    attempts = attempt,
                    exit_code = ?outcome.exit_code,
                    "Job failed permanently"
                );
                return Err(JobError::Failed {
                    job_id,
                    cwd,
                    attempts: attempt,
                    exit_code: outcome.exit_code,
                });
            }

            metrics.record_job_attempt(AttemptOutcome::Retried);
            warn!(
                job_id = %job_id,
                cwd = %cwd.display(),
                attempt = attempt,
                max_tries = policy.max_tries(),
                exit_code = ?outcome.exit_code,
                "Job attempt failed, resubmitting"
            );
            attempt += 1;
            current = executor.submit(&script, &cwd).await?;
            in_flight = metrics.record_job_submitted();
        }
    }
}

impl fmt::Debug for RetryingJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryingJob")
            .field("executor", &self.executor.name())
            .field("cwd", &self.cwd)
            .field("attempt", &self.attempt)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Submits `script` in `cwd` with retries owned by the returned job.
pub async fn submit_with_retry(
    executor: Arc<dyn Executor>,
    script: String,
    cwd: PathBuf,
    policy: RetryPolicy,
) -> Result<RetryingJob, ExecutorError> {
    RetryingJob::start(executor, script, cwd, policy).await
}
