//! The bounded executor for format writer work.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::sync::Semaphore;

use crate::error::{SubscriberError, SubscriberResult, ERR_WRITER_POOL_CLOSED};

/// A bounded pool for running blocking writer functions.
///
/// At most `size` writer functions run at any one time. Callers await the completion of their
/// function, so a message is never acknowledged before its side effects have happened, and a slow
/// writer only throttles the listener awaiting it.
#[derive(Clone)]
pub struct WriterPool {
    permits: Arc<Semaphore>,
}

impl WriterPool {
    /// Create a new pool running at most `size` writer functions concurrently.
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Run the given blocking function on the pool, awaiting its output.
    ///
    /// A closed pool is a subscriber fatal error; a writer which panics is an evaluation fatal
    /// error, as it can not be trusted to have left its outputs in a retry-friendly state.
    #[tracing::instrument(level = "trace", skip(self, f))]
    pub async fn spawn_blocking<F, R>(&self, f: F) -> SubscriberResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SubscriberError::subscriber(anyhow!(ERR_WRITER_POOL_CLOSED)))?;
        tokio::task::spawn_blocking(f)
            .await
            .context("writer task failed to complete")
            .map_err(SubscriberError::evaluation)
    }

    /// Close the pool, rejecting all further work. Work already running completes.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Check if the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
