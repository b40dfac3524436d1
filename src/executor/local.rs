//! Executor that launches job scripts as local processes.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use super::Executor;
use crate::error::ExecutorError;
use crate::job::{Job, JobOutcome};

/// Default command used to run a job script.
pub const DEFAULT_SUBMIT_CMD: &str = "bash";

/// Runs each job script as `<submit_cmd> <script>` inside the job directory.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    name: String,
    work_dir: PathBuf,
    submit_cmd: Vec<String>,
}

impl LocalExecutor {
    /// Creates an executor that runs scripts with `bash`.
    pub fn new(name: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            work_dir: work_dir.into(),
            submit_cmd: vec![DEFAULT_SUBMIT_CMD.to_string()],
        }
    }

    /// Sets the submit command, split on whitespace.
    ///
    /// A blank command falls back to `bash`.
    pub fn with_submit_cmd(mut self, submit_cmd: &str) -> Self {
        let parts: Vec<String> = submit_cmd.split_whitespace().map(str::to_string).collect();
        if !parts.is_empty() {
            self.submit_cmd = parts;
        }
        self
    }

    pub fn submit_cmd(&self) -> &[String] {
        &self.submit_cmd
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    async fn submit(&self, script: &str, cwd: &Path) -> Result<Job, ExecutorError> {
        let job_id = Uuid::new_v4();
        let stem = format!("job-{}", &job_id.simple().to_string()[..8]);
        let script_path = cwd.join(format!("{stem}.sh"));
        let log_path = cwd.join(format!("{stem}.out"));

        tokio::fs::write(&script_path, script).await?;
        let log = tokio::fs::File::create(&log_path).await?;
        let log_err = log.try_clone().await?;
        let (log, log_err) = (log.into_std().await, log_err.into_std().await);

        let (program, args) = self
            .submit_cmd
            .split_first()
            .map(|(p, rest)| (p.as_str(), rest))
            .unwrap_or((DEFAULT_SUBMIT_CMD, &[][..]));

        let mut child = Command::new(program)
            .args(args)
            .arg(&script_path)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                cwd: cwd.to_path_buf(),
                source,
            })?;

        info!(
            executor = %self.name,
            job_id = %job_id,
            cwd = %cwd.display(),
            "Submitted job"
        );

        let started_at = Utc::now();
        Ok(Job::spawn(job_id, cwd, async move {
            let status = child.wait().await?;
            debug!(job_id = %job_id, status = %status, "Job exited");
            Ok(JobOutcome {
                job_id,
                exit_code: status.code(),
                started_at,
                finished_at: Utc::now(),
                log_file: Some(log_path),
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_submit_cmd_parsing() {
        let executor = LocalExecutor::new("hpc", "/work").with_submit_cmd("sbatch --wait");
        assert_eq!(executor.submit_cmd(), &["sbatch".to_string(), "--wait".to_string()]);

        let blank = LocalExecutor::new("local", "/work").with_submit_cmd("   ");
        assert_eq!(blank.submit_cmd(), &["bash".to_string()]);
    }

    #[tokio::test]
    async fn test_submit_runs_script_in_cwd() {
        let temp = TempDir::new().unwrap();
        let executor = LocalExecutor::new("local", temp.path());

        let job = executor
            .submit("echo hello > greeting.txt\necho logged\n", temp.path())
            .await
            .expect("submit should succeed");
        let outcome = job.wait().await.expect("job should finish");

        assert!(outcome.exited_cleanly());
        let greeting = std::fs::read_to_string(temp.path().join("greeting.txt")).unwrap();
        assert_eq!(greeting.trim(), "hello");
        let log = std::fs::read_to_string(outcome.log_file.unwrap()).unwrap();
        assert!(log.contains("logged"));
    }

    #[tokio::test]
    async fn test_stdout_and_stderr_share_the_log() {
        let temp = TempDir::new().unwrap();
        let executor = LocalExecutor::new("local", temp.path());

        let outcome = executor
            .submit("echo to-stdout\necho to-stderr >&2\n", temp.path())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let log_file = outcome.log_file.unwrap();
        assert_eq!(log_file.parent(), Some(temp.path()));
        let log = std::fs::read_to_string(log_file).unwrap();
        assert!(log.contains("to-stdout"));
        assert!(log.contains("to-stderr"));
    }

    #[tokio::test]
    async fn test_submit_reports_exit_code() {
        let temp = TempDir::new().unwrap();
        let executor = LocalExecutor::new("local", temp.path());

        let outcome = executor
            .submit("exit 3\n", temp.path())
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, Some(3));
        assert!(!outcome.exited_cleanly());
    }

    #[tokio::test]
    async fn test_submit_missing_cwd_fails() {
        let temp = TempDir::new().unwrap();
        let executor = LocalExecutor::new("local", temp.path());

        let result = executor.submit("true\n", &temp.path().join("missing")).await;
        assert!(result.is_err());
    }
}
