//! Jobs, futures and the gather/retry layer.
//!
//! This is the concurrency core of the orchestrator:
//!
//! - **Job**: handle to one unit of work launched on an executor. The work
//!   runs on its own from the moment it is submitted; the handle only lets
//!   the caller wait for its outcome.
//! - **StageFuture**: lazy, composable value over zero or more jobs. It can
//!   be immediately resolved, wrap a single job, or gather many.
//! - **RetryingJob**: owns re-submission and attempt counting for one job.
//! - **gather**: combines many retrying jobs into one future whose result
//!   keeps the submission order.
//!
//! # Example
//!
//! ```rust,ignore
//! use mlp_forge::job::{gather, submit_with_retry, RetryPolicy};
//!
//! let mut jobs = Vec::new();
//! for (script, cwd) in scripts {
//!     jobs.push(submit_with_retry(executor.clone(), script, cwd, RetryPolicy::new(2)).await?);
//! }
//! // Every job is already running here.
//! let outcomes = gather(jobs, true).result().await?;
//! ```

pub mod future;
pub mod gather;
pub mod retry;

pub use future::StageFuture;
pub use gather::{gather, gather_outcomes};
pub use retry::{submit_with_retry, DoneCheck, RetryPolicy, RetryingJob};

use std::future::Future;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::ExecutorError;

/// What an executor reports once a unit of work has exited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    /// Process exit code; `None` when killed by a signal.
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Combined stdout/stderr of the job, if captured.
    pub log_file: Option<PathBuf>,
}

impl JobOutcome {
    /// Returns whether the process exited with code 0.
    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Wall-clock duration of the job.
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Handle to one submitted unit of work.
#[derive(Debug)]
pub struct Job {
    id: Uuid,
    cwd: PathBuf,
    handle: JoinHandle<Result<JobOutcome, ExecutorError>>,
}

impl Job {
    /// Starts driving `work` in the background and returns its handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(id: Uuid, cwd: impl Into<PathBuf>, work: F) -> Self
    where
        F: Future<Output = Result<JobOutcome, ExecutorError>> + Send + 'static,
    {
        Self {
            id,
            cwd: cwd.into(),
            handle: tokio::spawn(work),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Waits for the work to exit.
    pub async fn wait(self) -> Result<JobOutcome, ExecutorError> {
        let job_id = self.id;
        self.handle.await.map_err(|e| ExecutorError::Wait {
            job_id,
            message: e.to_string(),
        })?
    }
}
