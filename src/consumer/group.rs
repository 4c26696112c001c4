use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::Mutex;

use crate::consumer::ConsumeResult;
use crate::error::{SubscriberError, SubscriberResult};
use crate::pool::WriterPool;

/// A single-use buffer for the statistics of one message group.
///
/// Messages are cached by message id until the expected number of messages has been accepted,
/// at which point the whole group is flushed to the inner writer, exactly once. Accepting a
/// message id a second time replaces the cached value without counting it again, so redelivered
/// messages are harmless.
pub struct GroupConsumer<T> {
    group_id: String,
    inner: Arc<dyn Fn(Vec<T>) -> ConsumeResult + Send + Sync>,
    pool: WriterPool,
    state: Mutex<GroupState<T>>,
    complete: AtomicBool,
}

/// The states of a group.
enum GroupState<T> {
    /// Accepting messages.
    Pending {
        cache: BTreeMap<String, T>,
        expected: u64,
        actual: u64,
    },
    /// Flushed. No further operations are valid.
    Complete { paths: BTreeSet<PathBuf> },
}

impl<T: Clone + Send + 'static> GroupConsumer<T> {
    /// Create a new instance flushing to the given writer on the given pool.
    pub fn new(group_id: impl Into<String>, inner: Arc<dyn Fn(Vec<T>) -> ConsumeResult + Send + Sync>, pool: WriterPool) -> Self {
        Self {
            group_id: group_id.into(),
            inner,
            pool,
            state: Mutex::new(GroupState::Pending {
                cache: Default::default(),
                expected: 0,
                actual: 0,
            }),
            complete: AtomicBool::new(false),
        }
    }

    /// The id of this group.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Accept a message of this group.
    ///
    /// Returns the paths written if this message completed the group.
    #[tracing::instrument(level = "trace", skip(self, value), fields(group = %self.group_id))]
    pub async fn accept(&self, message_id: &str, value: T) -> SubscriberResult<Option<BTreeSet<PathBuf>>> {
        let mut state = self.state.lock().await;
        match &mut *state {
            GroupState::Complete { .. } => Err(self.reuse_error()),
            GroupState::Pending { cache, actual, .. } => {
                if cache.insert(message_id.to_string(), value).is_none() {
                    *actual += 1;
                }
                self.attempt_completion(&mut state).await
            }
        }
    }

    /// Set the number of messages expected in this group.
    ///
    /// Returns the paths written if this completed the group. Setting the same count again is a
    /// no-op, as producer notifications may be redelivered.
    #[tracing::instrument(level = "trace", skip(self), fields(group = %self.group_id))]
    pub async fn set_expected_count(&self, count: u64) -> SubscriberResult<Option<BTreeSet<PathBuf>>> {
        if count == 0 {
            return Err(SubscriberError::protocol(anyhow!(
                "the expected message count of group {} must be greater than zero",
                self.group_id
            )));
        }
        let mut state = self.state.lock().await;
        match &mut *state {
            GroupState::Complete { .. } => Err(self.reuse_error()),
            GroupState::Pending { expected, .. } => {
                if *expected != 0 && *expected != count {
                    return Err(SubscriberError::protocol(anyhow!(
                        "the expected message count of group {} was already set to {}, can not set to {}",
                        self.group_id,
                        expected,
                        count
                    )));
                }
                *expected = count;
                self.attempt_completion(&mut state).await
            }
        }
    }

    /// Flush the group if all expected messages have been accepted.
    ///
    /// This runs under the state lock, so the final check and the flush are one step. If the
    /// writer fails, the cache is retained so that the flush is retried by the next redelivery.
    async fn attempt_completion(&self, state: &mut GroupState<T>) -> SubscriberResult<Option<BTreeSet<PathBuf>>> {
        let snapshot = match state {
            GroupState::Pending { cache, expected, actual } if *expected > 0 && *expected == *actual => cache.values().cloned().collect::<Vec<_>>(),
            _ => return Ok(None),
        };

        tracing::debug!(group = %self.group_id, count = snapshot.len(), "flushing message group");
        let inner = self.inner.clone();
        let paths = self.pool.spawn_blocking(move || (inner)(snapshot)).await??;
        *state = GroupState::Complete { paths: paths.clone() };
        self.complete.store(true, Ordering::SeqCst);
        Ok(Some(paths))
    }

    /// Check if this group has been flushed.
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// The number of distinct messages accepted so far.
    pub async fn actual_count(&self) -> u64 {
        match &*self.state.lock().await {
            GroupState::Pending { actual, .. } => *actual,
            GroupState::Complete { .. } => 0,
        }
    }

    /// The expected number of messages, or zero if not yet known.
    pub async fn expected_count(&self) -> u64 {
        match &*self.state.lock().await {
            GroupState::Pending { expected, .. } => *expected,
            GroupState::Complete { .. } => 0,
        }
    }

    /// The paths written by the flush of this group, empty if not yet flushed.
    pub async fn paths(&self) -> BTreeSet<PathBuf> {
        match &*self.state.lock().await {
            GroupState::Pending { .. } => Default::default(),
            GroupState::Complete { paths } => paths.clone(),
        }
    }

    fn reuse_error(&self) -> SubscriberError {
        SubscriberError::protocol(anyhow!("illegal reuse of group consumer {}, which has already been flushed", self.group_id))
    }
}
