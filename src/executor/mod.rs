//! Compute backends.
//!
//! An [`Executor`] owns a workspace directory and knows how to launch units
//! of work in it. Stages never touch processes directly: they prepare task
//! directories (with [`Executor::setup_workspace`] and `run_function`), render
//! a script, and [`Executor::submit`] it. Submission returns a [`Job`] right
//! away; the work keeps running until the job is waited on or finishes.
//!
//! [`LocalExecutor`] is the bundled backend. It launches scripts with a
//! configurable submit command, which is plain `bash` by default and can be a
//! blocking queue submission such as `sbatch --wait`.

pub mod local;

pub use local::LocalExecutor;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::ExecutorError;
use crate::job::Job;

/// A compute backend with a workspace.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of the executor in the configuration.
    fn name(&self) -> &str;

    /// Root of the executor workspace.
    fn work_dir(&self) -> &Path;

    /// Absolute location of a workspace-relative path prefix.
    fn resolve(&self, path_prefix: &Path) -> PathBuf {
        self.work_dir().join(path_prefix)
    }

    /// Creates `base_dir` and each of `subdirs` under it, returning the
    /// subdirectory paths in the order given.
    ///
    /// Existing directories and their contents are left untouched.
    async fn setup_workspace(
        &self,
        base_dir: &Path,
        subdirs: &[&str],
    ) -> Result<Vec<PathBuf>, ExecutorError> {
        create_dir(base_dir).await?;
        let base_dir = tokio::fs::canonicalize(base_dir)
            .await
            .map_err(|source| ExecutorError::Workspace {
                path: base_dir.to_path_buf(),
                source,
            })?;

        let mut paths = Vec::with_capacity(subdirs.len());
        for subdir in subdirs {
            let path = base_dir.join(subdir);
            create_dir(&path).await?;
            paths.push(path);
        }
        debug!(executor = self.name(), base_dir = %base_dir.display(), "Workspace ready");
        Ok(paths)
    }

    /// Launches `script` with `cwd` as working directory.
    ///
    /// Returns as soon as the work has started.
    async fn submit(&self, script: &str, cwd: &Path) -> Result<Job, ExecutorError>;
}

impl dyn Executor {
    /// Runs a synchronous data-preparation function for this executor.
    ///
    /// The function runs on the blocking thread pool so filesystem-heavy
    /// preparation does not stall the orchestrator.
    pub async fn run_function<T, E, F>(&self, function: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<ExecutorError> + Send + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        tokio::task::spawn_blocking(function)
            .await
            .map_err(|e| {
                E::from(ExecutorError::Function {
                    executor: self.name().to_string(),
                    message: e.to_string(),
                })
            })?
    }
}

async fn create_dir(path: &Path) -> Result<(), ExecutorError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| ExecutorError::Workspace {
            path: path.to_path_buf(),
            source,
        })
}
