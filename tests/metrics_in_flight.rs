//! In-progress job accounting across early-returning gathers.
//!
//! Kept in its own test binary: the gauge is process-wide.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use mlp_forge::error::JobError;
use mlp_forge::executor::{Executor, LocalExecutor};
use mlp_forge::job::{gather, submit_with_retry, RetryPolicy};
use mlp_forge::metrics::{init_metrics, JOBS_IN_PROGRESS};

fn in_progress() -> f64 {
    JOBS_IN_PROGRESS.get().map(|gauge| gauge.get()).unwrap_or_default()
}

#[tokio::test]
async fn test_in_progress_gauge_settles_after_failed_gather() {
    init_metrics().unwrap();
    let temp = TempDir::new().unwrap();
    let executor: Arc<dyn Executor> = Arc::new(LocalExecutor::new("local", temp.path()));
    let before = in_progress();

    let slow = submit_with_retry(
        executor.clone(),
        "sleep 0.2\n".to_string(),
        temp.path().to_path_buf(),
        RetryPolicy::new(1),
    )
    .await
    .unwrap();
    let bad = submit_with_retry(
        executor.clone(),
        "exit 1\n".to_string(),
        temp.path().to_path_buf(),
        RetryPolicy::new(2),
    )
    .await
    .unwrap();
    assert_eq!(in_progress(), before + 2.0);

    let err = gather(vec![slow, bad], true).result().await.unwrap_err();
    assert!(matches!(err, JobError::Aggregate { index: 1, total: 2, .. }));

    // The slow sibling has exited by now; nothing is left counted.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(in_progress(), before);
}
