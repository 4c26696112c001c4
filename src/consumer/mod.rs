//! Evaluation consumption.
//!
//! Each evaluation claimed by a subscriber is consumed by exactly one `EvaluationConsumer`, which
//! routes statistics to the format writers supplied by a `ConsumerFactory`, and buffers grouped
//! statistics in a `GroupConsumer` per message group until the group is complete.

mod evaluation;
mod group;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::SubscriberResult;
use crate::models::{ConsumerDescription, Evaluation, Statistics};

pub use evaluation::EvaluationConsumer;
pub use group::GroupConsumer;

/// The output of a writer: the set of resources it created.
pub type ConsumeResult = SubscriberResult<BTreeSet<PathBuf>>;

/// A writer which consumes statistics one message at a time.
///
/// Writers must be retry-friendly: a writer which fails must clean up any partial output first,
/// as it may be invoked again with the same statistics and output path.
pub type IncrementalConsumer = Arc<dyn Fn(&Statistics) -> ConsumeResult + Send + Sync>;

/// A writer which consumes all statistics of one message group at once.
pub type GroupedConsumer = Arc<dyn Fn(Vec<Statistics>) -> ConsumeResult + Send + Sync>;

/// A type capable of creating the writers of an evaluation.
pub trait ConsumerFactory: Send + Sync + 'static {
    /// Create the incremental writer of the given evaluation, writing beneath `path`.
    fn consumer(&self, evaluation: &Evaluation, path: &Path) -> SubscriberResult<IncrementalConsumer>;

    /// Create the grouped writer of the given evaluation, writing beneath `path`.
    fn grouped_consumer(&self, evaluation: &Evaluation, path: &Path) -> SubscriberResult<GroupedConsumer>;

    /// A description of the subscriber whose writers this factory creates.
    fn consumer_description(&self) -> ConsumerDescription;
}
