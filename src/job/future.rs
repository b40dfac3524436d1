//! Lazy, composable results of asynchronous work.

use std::fmt;
use std::future::Future;

use futures::future::{self, BoxFuture};
use futures::{FutureExt, TryFutureExt};

use crate::error::JobError;

/// Eventually available value produced by zero or more jobs.
///
/// Nothing is awaited until [`StageFuture::result`] is called. The jobs
/// behind the future were launched when it was built and keep running on
/// their own, so building several futures before resolving any of them runs
/// their work concurrently.
#[must_use = "a StageFuture does nothing until `result` is awaited"]
pub struct StageFuture<T> {
    inner: BoxFuture<'static, Result<T, JobError>>,
}

impl<T: Send + 'static> StageFuture<T> {
    /// Wraps an asynchronous computation.
    pub fn new<F>(work: F) -> Self
    where
        F: Future<Output = Result<T, JobError>> + Send + 'static,
    {
        Self {
            inner: work.boxed(),
        }
    }

    /// A future that needs no jobs.
    pub fn ready(value: T) -> Self {
        Self {
            inner: future::ready(Ok(value)).boxed(),
        }
    }

    /// A future that has already failed.
    pub fn failed(error: JobError) -> Self {
        Self {
            inner: future::ready(Err(error)).boxed(),
        }
    }

    /// Applies `transform` to the eventual value.
    pub fn map<U, F>(self, transform: F) -> StageFuture<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        StageFuture {
            inner: self.inner.map_ok(transform).boxed(),
        }
    }

    /// Resolves to `value` once the underlying work has completed.
    pub fn replace<U: Send + 'static>(self, value: U) -> StageFuture<U> {
        self.map(move |_| value)
    }

    /// Waits for the value.
    pub async fn result(self) -> Result<T, JobError> {
        self.inner.await
    }
}

impl<T> fmt::Debug for StageFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageFuture").finish_non_exhaustive()
    }
}
