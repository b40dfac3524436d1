//! Combining many jobs into one future.

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::error;

use super::future::StageFuture;
use super::retry::RetryingJob;
use super::JobOutcome;
use crate::error::JobError;

/// Combines `jobs` into one future resolving to their results in the order
/// the jobs were given, regardless of completion order.
///
/// Jobs are waited on concurrently. With `raise_exception` set, the future
/// fails with [`JobError::Aggregate`] as soon as any job fails permanently;
/// the remaining jobs keep running but their results are dropped. Without
/// it, every slot holds that job's own result.
pub fn gather(
    jobs: Vec<RetryingJob>,
    raise_exception: bool,
) -> StageFuture<Vec<Result<JobOutcome, JobError>>> {
    if jobs.is_empty() {
        return StageFuture::ready(Vec::new());
    }

    StageFuture::new(async move {
        let total = jobs.len();
        let mut pending: FuturesUnordered<_> = jobs
            .into_iter()
            .enumerate()
            .map(|(index, job)| async move { (index, job.wait().await) })
            .collect();

        let mut slots: Vec<Option<Result<JobOutcome, JobError>>> =
            std::iter::repeat_with(|| None).take(total).collect();

        while let Some((index, result)) = pending.next().await {
            if raise_exception {
                if let Err(first) = result {
                    error!(index = index, total = total, error = %first, "Gathered job failed");
                    return Err(JobError::Aggregate {
                        index,
                        total,
                        first: Box::new(first),
                    });
                }
            }
            slots[index] = Some(result);
        }

        Ok(slots.into_iter().flatten().collect())
    })
}

/// Gathers `jobs`, failing on the first permanent failure, and keeps only
/// the outcomes.
pub fn gather_outcomes(jobs: Vec<RetryingJob>) -> StageFuture<Vec<JobOutcome>> {
    gather(jobs, true).map(|results| results.into_iter().filter_map(Result::ok).collect())
}
