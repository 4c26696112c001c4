use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::broker::{MessageMetadata, MessagePublisher};
use crate::config::Config;
use crate::consumer::{ConsumerFactory, GroupConsumer, GroupedConsumer, IncrementalConsumer};
use crate::error::{SubscriberError, SubscriberResult, ERR_PUBLISH_STATUS};
use crate::models::{CompletionStatus, ConsumerDescription, Evaluation, EvaluationStatus, EvaluationStatusEvent, Statistics};
use crate::pool::WriterPool;
use crate::status::SubscriberStatus;
use crate::utils;

/// The writers of an evaluation, available once its description has arrived.
#[derive(Clone)]
struct Writers {
    incremental: IncrementalConsumer,
    grouped: GroupedConsumer,
}

/// A message which arrived before the evaluation description.
#[derive(Clone)]
enum EarlyArrival {
    Statistics {
        message_id: String,
        group_id: Option<String>,
        statistics: Statistics,
    },
    GroupCount {
        group_id: String,
        count: u64,
    },
}

enum Phase {
    /// The writers are not yet known, so messages are queued.
    ///
    /// The writers are retained once created, so that a failed drain of the queue resumes where
    /// it left off when the description is redelivered.
    AwaitingDescription { queue: VecDeque<EarlyArrival>, writers: Option<Writers> },
    Ready(Writers),
    Closed,
}

struct ConsumerState {
    phase: Phase,
    /// The message id of the accepted description.
    description_id: Option<String>,
}

struct GroupSlot {
    consumer: GroupConsumer<Statistics>,
    /// True once the group's consumption has been reported.
    notified: Mutex<bool>,
}

/// The consumer of exactly one evaluation.
///
/// Statistics which arrive before the evaluation description are queued and replayed in their
/// order of arrival once the description arrives. Statistics of a message group are additionally
/// buffered in the `GroupConsumer` of that group. Every unique message is consumed once, no matter
/// how often it is delivered.
pub struct EvaluationConsumer {
    evaluation_id: String,
    description: ConsumerDescription,
    config: Arc<Config>,
    factory: Arc<dyn ConsumerFactory>,
    publisher: Arc<dyn MessagePublisher>,
    pool: WriterPool,
    status: Arc<SubscriberStatus>,
    created: Instant,

    consumed: AtomicU64,
    expected: AtomicU64,
    incomplete_groups: AtomicUsize,
    completion_status: AtomicI32,
    ready: AtomicBool,
    complete: AtomicBool,
    failed: AtomicBool,
    closed: AtomicBool,

    /// The close lock, holding true once a terminal status has been published.
    terminal: Mutex<bool>,
    state: Mutex<ConsumerState>,
    groups: Mutex<HashMap<String, Arc<GroupSlot>>>,
    consumed_ids: Mutex<HashSet<String>>,
    paths_written: Mutex<BTreeSet<PathBuf>>,
    failure_events: Mutex<Vec<String>>,
}

impl EvaluationConsumer {
    /// Create a new instance.
    pub fn new(
        evaluation_id: impl Into<String>, config: Arc<Config>, factory: Arc<dyn ConsumerFactory>, publisher: Arc<dyn MessagePublisher>, pool: WriterPool,
        status: Arc<SubscriberStatus>,
    ) -> Self {
        // The subscriber identity is authoritative over the one the factory describes.
        let mut description = factory.consumer_description();
        description.consumer_id = config.subscriber_id.clone();
        Self {
            evaluation_id: evaluation_id.into(),
            description,
            config,
            factory,
            publisher,
            pool,
            status,
            created: Instant::now(),
            consumed: AtomicU64::new(0),
            expected: AtomicU64::new(0),
            incomplete_groups: AtomicUsize::new(0),
            completion_status: AtomicI32::new(CompletionStatus::ReadyToConsume as i32),
            ready: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            terminal: Mutex::new(false),
            state: Mutex::new(ConsumerState {
                phase: Phase::AwaitingDescription {
                    queue: Default::default(),
                    writers: None,
                },
                description_id: None,
            }),
            groups: Default::default(),
            consumed_ids: Default::default(),
            paths_written: Default::default(),
            failure_events: Default::default(),
        }
    }

    /// Accept the description of this evaluation.
    ///
    /// This creates the writers of the evaluation and replays every message which arrived early.
    /// The description may be accepted once only; a redelivery of the same description message
    /// is ignored, while any other description is a protocol violation.
    #[tracing::instrument(level = "debug", skip(self, evaluation), fields(evaluation = %self.evaluation_id))]
    pub async fn accept_evaluation_description(&self, evaluation: &Evaluation, message_id: &str, job_id: Option<&str>) -> SubscriberResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let writers = match &mut state.phase {
            Phase::Closed => {
                tracing::debug!(evaluation = %self.evaluation_id, message = message_id, "ignoring description of closed evaluation");
                return Ok(());
            }
            Phase::Ready(_) if state.description_id.as_deref() == Some(message_id) => {
                tracing::warn!(evaluation = %self.evaluation_id, message = message_id, "ignoring redelivered evaluation description");
                return Ok(());
            }
            Phase::Ready(_) => {
                return Err(SubscriberError::protocol(anyhow!(
                    "evaluation {} received a second evaluation description in message {}, which is not allowed",
                    self.evaluation_id,
                    message_id
                )));
            }
            Phase::AwaitingDescription { queue, writers } => {
                let writers = match writers.clone() {
                    Some(writers) => writers,
                    None => {
                        let created = self.create_writers(evaluation, job_id).await?;
                        *writers = Some(created.clone());
                        created
                    }
                };

                // Pop each message only once consumed, so that a failure resumes here.
                while let Some(arrival) = queue.front().cloned() {
                    self.consume_early_arrival(arrival, &writers).await?;
                    queue.pop_front();
                }
                writers
            }
        };

        state.phase = Phase::Ready(writers);
        state.description_id = Some(message_id.to_string());
        drop(guard);

        self.record_consumed(message_id).await;
        self.ready.store(true, Ordering::SeqCst);
        self.completion_status.store(CompletionStatus::ConsumptionOngoing as i32, Ordering::SeqCst);
        tracing::info!(evaluation = %self.evaluation_id, label = %evaluation.label, "evaluation description accepted, consumption ongoing");
        Ok(())
    }

    async fn create_writers(&self, evaluation: &Evaluation, job_id: Option<&str>) -> SubscriberResult<Writers> {
        let path = utils::evaluation_output_path(&self.config.output_directory, job_id, &self.evaluation_id);
        utils::create_output_directory(&path).await.map_err(SubscriberError::retryable)?;
        let incremental = self.factory.consumer(evaluation, &path)?;
        let grouped = self.factory.grouped_consumer(evaluation, &path)?;
        Ok(Writers { incremental, grouped })
    }

    async fn consume_early_arrival(&self, arrival: EarlyArrival, writers: &Writers) -> SubscriberResult<()> {
        match arrival {
            EarlyArrival::Statistics {
                message_id,
                group_id,
                statistics,
            } => self.consume_statistics(&message_id, group_id.as_deref(), statistics, writers).await,
            EarlyArrival::GroupCount { group_id, count } => self.set_group_count(&group_id, count, writers).await,
        }
    }

    /// Accept a statistics message, optionally belonging to a message group.
    ///
    /// Statistics arriving before the description are queued, never rejected.
    #[tracing::instrument(level = "debug", skip(self, statistics), fields(evaluation = %self.evaluation_id))]
    pub async fn accept_statistics(&self, statistics: Statistics, group_id: Option<&str>, message_id: &str) -> SubscriberResult<()> {
        if self.is_closed() || self.is_failed() {
            tracing::debug!(evaluation = %self.evaluation_id, message = message_id, "ignoring statistics of finished evaluation");
            return Ok(());
        }
        let group_id = group_id.filter(|id| !id.is_empty());

        let mut state = self.state.lock().await;
        let writers = match &mut state.phase {
            Phase::Closed => return Ok(()),
            Phase::Ready(writers) => writers.clone(),
            Phase::AwaitingDescription { queue, .. } => {
                let arrival = EarlyArrival::Statistics {
                    message_id: message_id.to_string(),
                    group_id: group_id.map(String::from),
                    statistics,
                };
                let existing = queue
                    .iter_mut()
                    .find(|queued| matches!(queued, EarlyArrival::Statistics { message_id: id, .. } if id == message_id));
                match existing {
                    Some(queued) => *queued = arrival,
                    None => queue.push_back(arrival),
                }
                tracing::debug!(evaluation = %self.evaluation_id, message = message_id, queued = queue.len(), "queued statistics awaiting evaluation description");
                return Ok(());
            }
        };
        drop(state);

        self.consume_statistics(message_id, group_id, statistics, &writers).await
    }

    async fn consume_statistics(&self, message_id: &str, group_id: Option<&str>, statistics: Statistics, writers: &Writers) -> SubscriberResult<()> {
        let consumed_before = self.consumed_ids.lock().await.contains(message_id);
        if !consumed_before {
            let slot = match group_id {
                Some(group_id) => Some(self.group(group_id, writers).await),
                None => None,
            };
            if let Some(slot) = slot.as_ref().filter(|slot| slot.consumer.is_complete()) {
                return Err(SubscriberError::protocol(anyhow!(
                    "message {} of evaluation {} belongs to group {}, which has already been flushed",
                    message_id,
                    self.evaluation_id,
                    slot.consumer.group_id()
                )));
            }

            let (incremental, payload) = (writers.incremental.clone(), statistics.clone());
            let paths = self.pool.spawn_blocking(move || (incremental)(&payload)).await??;
            self.paths_written.lock().await.extend(paths);

            if let Some(slot) = slot {
                let flushed = slot.consumer.accept(message_id, statistics).await?;
                self.on_group_flushed(flushed).await;
            }
            if self.record_consumed(message_id).await {
                self.status.register_statistics(message_id);
            }
        } else {
            tracing::debug!(evaluation = %self.evaluation_id, message = message_id, "statistics already consumed");
        }

        // A notification may be outstanding if its publication failed on an earlier delivery.
        if let Some(group_id) = group_id {
            self.close_group_if_complete(group_id).await?;
        }
        Ok(())
    }

    /// Accept a status message of this evaluation.
    #[tracing::instrument(level = "debug", skip(self, status), fields(evaluation = %self.evaluation_id))]
    pub async fn accept_status(&self, status: &EvaluationStatus, message_id: &str) -> SubscriberResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        match status.completion_status() {
            CompletionStatus::GroupPublicationComplete => self.accept_group_count(status, message_id).await,
            CompletionStatus::PublicationCompleteReportedSuccess => self.set_expected(u64::from(status.message_count)),
            other if other.is_producer_failure() => {
                tracing::error!(evaluation = %self.evaluation_id, status = ?other, "producer reported the evaluation as failed");
                self.failed.store(true, Ordering::SeqCst);
                self.complete.store(true, Ordering::SeqCst);
                self.close().await
            }
            other => {
                tracing::trace!(evaluation = %self.evaluation_id, status = ?other, "ignoring status message");
                Ok(())
            }
        }
    }

    async fn accept_group_count(&self, status: &EvaluationStatus, message_id: &str) -> SubscriberResult<()> {
        if status.group_id.is_empty() {
            return Err(SubscriberError::protocol(anyhow!(
                "group publication complete message {} of evaluation {} has no group id",
                message_id,
                self.evaluation_id
            )));
        }
        let count = u64::from(status.message_count);
        if count == 0 {
            tracing::warn!(evaluation = %self.evaluation_id, group = %status.group_id, "ignoring group publication complete with a count of zero");
            return Ok(());
        }

        let mut state = self.state.lock().await;
        let writers = match &mut state.phase {
            Phase::Closed => return Ok(()),
            Phase::Ready(writers) => writers.clone(),
            Phase::AwaitingDescription { queue, .. } => {
                queue.push_back(EarlyArrival::GroupCount {
                    group_id: status.group_id.clone(),
                    count,
                });
                return Ok(());
            }
        };
        drop(state);

        self.set_group_count(&status.group_id, count, &writers).await
    }

    async fn set_group_count(&self, group_id: &str, count: u64, writers: &Writers) -> SubscriberResult<()> {
        let slot = self.group(group_id, writers).await;
        if !slot.consumer.is_complete() {
            let flushed = slot.consumer.set_expected_count(count).await?;
            self.on_group_flushed(flushed).await;
        }
        self.close_group_if_complete(group_id).await
    }

    fn set_expected(&self, count: u64) -> SubscriberResult<()> {
        match self.expected.compare_exchange(0, count, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {
                tracing::debug!(evaluation = %self.evaluation_id, expected = count, "expected message count set");
                Ok(())
            }
            Err(existing) if existing == count => Ok(()),
            Err(existing) => Err(SubscriberError::protocol(anyhow!(
                "the expected message count of evaluation {} was already set to {}, can not set to {}",
                self.evaluation_id,
                existing,
                count
            ))),
        }
    }

    /// Get or create the group consumer of the given group.
    async fn group(&self, group_id: &str, writers: &Writers) -> Arc<GroupSlot> {
        let mut groups = self.groups.lock().await;
        if let Some(slot) = groups.get(group_id) {
            return slot.clone();
        }
        let slot = Arc::new(GroupSlot {
            consumer: GroupConsumer::new(group_id, writers.grouped.clone(), self.pool.clone()),
            notified: Mutex::new(false),
        });
        groups.insert(group_id.to_string(), slot.clone());
        self.incomplete_groups.fetch_add(1, Ordering::SeqCst);
        slot
    }

    async fn on_group_flushed(&self, flushed: Option<BTreeSet<PathBuf>>) {
        if let Some(paths) = flushed {
            self.incomplete_groups.fetch_sub(1, Ordering::SeqCst);
            self.paths_written.lock().await.extend(paths);
        }
    }

    /// Publish the consumption of the given group, once, if it is complete.
    async fn close_group_if_complete(&self, group_id: &str) -> SubscriberResult<()> {
        let slot = match self.groups.lock().await.get(group_id) {
            Some(slot) => slot.clone(),
            None => return Ok(()),
        };
        if !slot.consumer.is_complete() {
            return Ok(());
        }
        let mut notified = slot.notified.lock().await;
        if *notified {
            return Ok(());
        }
        let mut msg = EvaluationStatus::new(CompletionStatus::GroupConsumptionComplete, self.description.consumer_id.as_str());
        msg.group_id = group_id.to_string();
        msg.resources_created = to_resources(&slot.consumer.paths().await);
        self.publish_status(msg, Some(group_id)).await?;
        *notified = true;
        tracing::debug!(evaluation = %self.evaluation_id, group = group_id, "group consumption complete");
        Ok(())
    }

    /// Report every group which has not completed as consumed, so producers awaiting the group
    /// are released.
    async fn notify_incomplete_groups(&self) -> SubscriberResult<()> {
        let slots: Vec<_> = self.groups.lock().await.iter().map(|(id, slot)| (id.clone(), slot.clone())).collect();
        for (group_id, slot) in slots {
            let mut notified = slot.notified.lock().await;
            if *notified {
                continue;
            }
            let mut msg = EvaluationStatus::new(CompletionStatus::GroupConsumptionComplete, self.description.consumer_id.as_str());
            msg.group_id = group_id.clone();
            msg.resources_created = to_resources(&slot.consumer.paths().await);
            self.publish_status(msg, Some(&group_id)).await?;
            *notified = true;
        }
        Ok(())
    }

    /// Record the consumption of the given message, returning true if it had not been consumed before.
    async fn record_consumed(&self, message_id: &str) -> bool {
        let inserted = self.consumed_ids.lock().await.insert(message_id.to_string());
        if inserted {
            self.consumed.fetch_add(1, Ordering::SeqCst);
        }
        inserted
    }

    /// Check if this evaluation has been consumed in full.
    ///
    /// Consumption is complete once the expected message count is known and reached, and every
    /// message group has been flushed. Once complete, always complete.
    pub fn is_complete(&self) -> bool {
        if self.complete.load(Ordering::SeqCst) {
            return true;
        }
        let expected = self.expected.load(Ordering::SeqCst);
        let is_complete =
            expected > 0 && self.consumed.load(Ordering::SeqCst) == expected && self.incomplete_groups.load(Ordering::SeqCst) == 0;
        if is_complete {
            self.complete.store(true, Ordering::SeqCst);
        }
        is_complete
    }

    /// Close this evaluation, publishing its terminal status.
    ///
    /// A failed evaluation reports failure, a complete one success. Closing an evaluation which
    /// is neither reports failure and returns an error. Closing is idempotent.
    #[tracing::instrument(level = "debug", skip(self), fields(evaluation = %self.evaluation_id))]
    pub async fn close(&self) -> SubscriberResult<()> {
        let mut terminal = self.terminal.lock().await;
        if *terminal {
            return Ok(());
        }

        let premature = !self.is_failed() && !self.is_complete();
        if premature {
            self.failed.store(true, Ordering::SeqCst);
            self.failure_events
                .lock()
                .await
                .push(format!("evaluation {} was closed before consumption was complete", self.evaluation_id));
        }

        let paths = self.paths_written.lock().await.clone();
        let status = if self.is_failed() {
            self.notify_incomplete_groups().await?;
            let mut msg = EvaluationStatus::new(CompletionStatus::ConsumptionCompleteReportedFailure, self.description.consumer_id.as_str());
            msg.status_events = self.failure_events.lock().await.iter().map(|event| EvaluationStatusEvent::error(event.as_str())).collect();
            msg.resources_created = to_resources(&paths);
            msg
        } else {
            let mut msg = EvaluationStatus::new(CompletionStatus::ConsumptionCompleteReportedSuccess, self.description.consumer_id.as_str());
            msg.resources_created = to_resources(&paths);
            msg
        };
        let completion_status = status.completion_status;
        self.publish_status(status, None).await?;

        *terminal = true;
        self.closed.store(true, Ordering::SeqCst);
        self.completion_status.store(completion_status, Ordering::SeqCst);
        self.state.lock().await.phase = Phase::Closed;
        if self.is_failed() {
            self.status.register_evaluation_failed(&self.evaluation_id);
            tracing::error!(evaluation = %self.evaluation_id, paths = paths.len(), "evaluation closed after failure");
        } else {
            self.status.register_evaluation_completed(&self.evaluation_id);
            tracing::info!(
                evaluation = %self.evaluation_id,
                consumed = self.consumed(),
                "evaluation consumed successfully, {}",
                describe_paths(&paths)
            );
        }

        if premature {
            return Err(SubscriberError::evaluation(anyhow!(
                "evaluation {} was closed before consumption was complete, having consumed {} of {} expected messages",
                self.evaluation_id,
                self.consumed(),
                self.expected()
            )));
        }
        Ok(())
    }

    /// Close this evaluation as having succeeded.
    pub async fn mark_succeeded(&self) -> SubscriberResult<()> {
        self.close().await
    }

    /// Mark this evaluation as failed with the given cause and close it.
    ///
    /// The failure is reported with the cause chain of the error as status events. The first
    /// cause recorded wins, so a failure notification which must be retried keeps its cause.
    #[tracing::instrument(level = "debug", skip(self, cause), fields(evaluation = %self.evaluation_id))]
    pub async fn mark_failed(&self, cause: &SubscriberError) -> SubscriberResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        {
            let mut events = self.failure_events.lock().await;
            if events.is_empty() {
                *events = cause.cause_chain(self.config.max_cause_levels);
            }
        }
        tracing::error!(evaluation = %self.evaluation_id, error = %cause, "marking evaluation as failed");
        self.failed.store(true, Ordering::SeqCst);
        self.complete.store(true, Ordering::SeqCst);
        self.close().await
    }

    /// Publish the current consumption state, so producers know this subscriber is alive.
    pub async fn notify_alive(&self) -> SubscriberResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let mut msg = EvaluationStatus::new(CompletionStatus::ReadyToConsume, self.description.consumer_id.as_str());
        msg.completion_status = self.completion_status.load(Ordering::SeqCst);
        self.publish_status(msg, None).await
    }

    async fn publish_status(&self, mut msg: EvaluationStatus, group_id: Option<&str>) -> SubscriberResult<()> {
        msg.consumer = Some(self.description.clone());
        let metadata = MessageMetadata {
            message_id: Some(utils::new_message_id(&self.description.consumer_id)),
            correlation_id: Some(self.evaluation_id.clone()),
            consumer_id: Some(self.description.consumer_id.clone()),
            group_id: group_id.map(String::from),
            ..Default::default()
        };
        let body = utils::encode_model(&msg).map_err(SubscriberError::evaluation)?;
        self.publisher
            .publish(metadata, Bytes::from(body))
            .await
            .context(ERR_PUBLISH_STATUS)
            .map_err(SubscriberError::retryable)
    }

    pub fn evaluation_id(&self) -> &str {
        &self.evaluation_id
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::SeqCst)
    }

    pub fn expected(&self) -> u64 {
        self.expected.load(Ordering::SeqCst)
    }

    /// Check if the evaluation description has been accepted.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The time elapsed since this consumer was created.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// The resources written so far.
    pub async fn paths_written(&self) -> BTreeSet<PathBuf> {
        self.paths_written.lock().await.clone()
    }
}

fn to_resources(paths: &BTreeSet<PathBuf>) -> Vec<String> {
    paths.iter().map(|path| path.to_string_lossy().into_owned()).collect()
}

fn describe_paths(paths: &BTreeSet<PathBuf>) -> String {
    match paths.len() {
        0 => "no paths were written".into(),
        len => {
            let listed: Vec<_> = paths.iter().map(|path| path.display().to_string()).collect();
            format!("{} paths were written: {}", len, listed.join(", "))
        }
    }
}
