//! The evaluation subscriber.
//!
//! A subscriber owns one listener per message stream, plus a housekeeping task. Each listener
//! decides whether an inbound message is claimed by this subscriber, routes it to the consumer
//! of its evaluation, and classifies any error at the boundary:
//!
//! - retryable errors are answered with a redelivery request after an exponential backoff, until
//!   the evaluation's retries are exhausted and it is marked failed;
//! - evaluation fatal errors and protocol violations mark the evaluation failed immediately;
//! - subscriber fatal errors mark the subscriber and every open evaluation failed, after which the
//!   subscriber shuts down and reports the error from `join`.

mod housekeeping;
mod listener;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::broker::{Broker, MessagePublisher, SubscriptionSetup, Topic};
use crate::config::Config;
use crate::consumer::{ConsumerFactory, EvaluationConsumer};
use crate::error::{SubscriberError, SubscriberResult};
use crate::negotiation::{SubscriberApprover, SubscriberOfferer};
use crate::pool::WriterPool;
use crate::status::SubscriberStatus;
use housekeeping::Housekeeper;
use listener::Listener;

/// The number of retired evaluation ids remembered, oldest forgotten first.
const MAX_RETIRED_EVALUATIONS: usize = 4096;

/// The topics to which a subscriber listens.
const TOPICS: [Topic; 3] = [Topic::Status, Topic::Evaluation, Topic::Statistics];

/// A subscriber consuming the evaluations claimed by it.
pub struct Subscriber {
    core: Arc<SubscriberCore>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for observing shutdown, triggered by a subscriber failure.
    shutdown_rx: BroadcastStream<()>,
    /// The join handles of the listeners and the housekeeper.
    handles: Vec<JoinHandle<SubscriberResult<()>>>,
}

/// The state shared by the tasks of a subscriber.
pub(crate) struct SubscriberCore {
    config: Arc<Config>,
    factory: Arc<dyn ConsumerFactory>,
    broker: Arc<dyn Broker>,
    publisher: Arc<dyn MessagePublisher>,
    offerer: SubscriberOfferer,
    pool: WriterPool,
    status: Arc<SubscriberStatus>,
    registry: Mutex<Registry>,
    closing: AtomicBool,
}

/// The evaluations known to a subscriber, guarded by one coarse lock.
#[derive(Default)]
struct Registry {
    evaluations: HashMap<String, Arc<EvaluationConsumer>>,
    /// The number of redeliveries requested per evaluation, along with when counting started.
    retries: HashMap<String, (Instant, Arc<AtomicU32>)>,
    /// Evaluations which have been consumed and swept.
    retired: HashSet<String>,
    /// The retired evaluations in order of retirement.
    retired_order: VecDeque<String>,
}

impl Registry {
    /// Remove the given evaluation, remembering it as retired.
    fn retire(&mut self, evaluation_id: &str) {
        self.evaluations.remove(evaluation_id);
        self.retries.remove(evaluation_id);
        if self.retired.insert(evaluation_id.to_string()) {
            self.retired_order.push_back(evaluation_id.to_string());
        }
        while self.retired_order.len() > MAX_RETIRED_EVALUATIONS {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }
}

impl Subscriber {
    /// Create a new subscriber, subscribing to every topic of the given broker.
    pub async fn new(config: Arc<Config>, factory: Arc<dyn ConsumerFactory>, broker: Arc<dyn Broker>) -> Result<Self> {
        config.validate()?;
        let approver: SubscriberApprover = match config.format_approvals.as_deref() {
            Some(approvals) => approvals.parse().context("error parsing format approvals")?,
            None => SubscriberApprover::new(),
        };
        let publisher = broker.publisher(Topic::Status).context("error creating status publisher")?;
        let mut description = factory.consumer_description();
        description.consumer_id = config.subscriber_id.clone();
        let offerer = SubscriberOfferer::new(description, publisher.clone(), approver, &config);
        let status = Arc::new(SubscriberStatus::new(config.subscriber_id.as_str()));

        let core = Arc::new(SubscriberCore {
            pool: WriterPool::new(config.writer_threads),
            config: config.clone(),
            factory,
            broker: broker.clone(),
            publisher,
            offerer,
            status,
            registry: Default::default(),
            closing: AtomicBool::new(false),
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handles = Vec::with_capacity(TOPICS.len() + 1);
        for topic in TOPICS {
            let setup = SubscriptionSetup {
                topic,
                name: subscription_name(&config, topic),
                durable: config.durable_subscriptions,
            };
            let deliveries = broker
                .subscribe(setup)
                .await
                .with_context(|| format!("error subscribing to {} topic", topic))?;
            handles.push(Listener::new(core.clone(), topic, deliveries, shutdown_tx.clone()).spawn());
        }
        handles.push(Housekeeper::new(core.clone(), shutdown_tx.subscribe()).spawn());

        tracing::info!(
            subscriber = %config.subscriber_id,
            durable = config.durable_subscriptions,
            booking = config.booking_enabled,
            writer_threads = config.writer_threads,
            "subscriber started"
        );
        Ok(Self {
            core,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            handles,
        })
    }

    /// The identity of this subscriber.
    pub fn id(&self) -> &str {
        &self.core.config.subscriber_id
    }

    /// The health and throughput of this subscriber.
    pub fn status(&self) -> Arc<SubscriberStatus> {
        self.core.status.clone()
    }

    /// The consumer of the given evaluation, if known to this subscriber.
    pub async fn evaluation(&self, evaluation_id: &str) -> Option<Arc<EvaluationConsumer>> {
        self.core.registry.lock().await.evaluations.get(evaluation_id).cloned()
    }

    /// Await the failure of this subscriber, then close it, returning the failure.
    pub async fn join(mut self) -> SubscriberResult<()> {
        let _ = self.shutdown_rx.next().await;
        self.close().await
    }

    /// Close this subscriber.
    ///
    /// Open evaluations are not completed; they are logged as abandoned. Durable subscriptions are
    /// removed only when no evaluation remains open.
    pub async fn close(self) -> SubscriberResult<()> {
        tracing::debug!(subscriber = %self.core.config.subscriber_id, "subscriber is shutting down");
        self.core.closing.store(true, Ordering::SeqCst);
        let open = self.core.open_evaluations().await;
        for consumer in open.iter() {
            tracing::error!(
                evaluation = %consumer.evaluation_id(),
                consumed = consumer.consumed(),
                expected = consumer.expected(),
                "abandoning open evaluation on subscriber shutdown"
            );
        }

        let _ = self.shutdown_tx.send(());
        let mut result = Ok(());
        for handle in self.handles {
            match handle.await {
                Ok(Ok(())) => (),
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "subscriber task failed");
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
                Err(err) => tracing::error!(error = ?err, "error joining subscriber task"),
            }
        }

        if self.core.config.durable_subscriptions && open.is_empty() {
            for topic in TOPICS {
                let name = subscription_name(&self.core.config, topic);
                if let Err(err) = self.core.broker.unsubscribe(topic, &name).await {
                    tracing::warn!(error = ?err, subscription = %name, "error removing durable subscription");
                }
            }
        }
        self.core.pool.close();
        tracing::info!(status = %self.core.status, "subscriber closed");
        result
    }
}

impl SubscriberCore {
    /// Get or create the consumer of the given evaluation.
    ///
    /// Returns `None` if the evaluation has been retired or has failed, or if the subscriber is
    /// closing, in which case the message is not for consumption.
    async fn get_or_create(&self, evaluation_id: &str) -> Option<Arc<EvaluationConsumer>> {
        let mut registry = self.registry.lock().await;
        if registry.retired.contains(evaluation_id) {
            tracing::debug!(evaluation = evaluation_id, "ignoring message of retired evaluation");
            return None;
        }
        if let Some(consumer) = registry.evaluations.get(evaluation_id) {
            if consumer.is_failed() {
                tracing::debug!(evaluation = evaluation_id, "ignoring message of failed evaluation");
                return None;
            }
            return Some(consumer.clone());
        }
        if self.closing.load(Ordering::SeqCst) {
            return None;
        }

        let consumer = Arc::new(EvaluationConsumer::new(
            evaluation_id,
            self.config.clone(),
            self.factory.clone(),
            self.publisher.clone(),
            self.pool.clone(),
            self.status.clone(),
        ));
        registry.evaluations.insert(evaluation_id.to_string(), consumer.clone());
        self.status.register_evaluation_started(evaluation_id);
        tracing::info!(evaluation = evaluation_id, "opened evaluation consumer");
        Some(consumer)
    }

    /// The evaluations which have not yet been closed.
    async fn open_evaluations(&self) -> Vec<Arc<EvaluationConsumer>> {
        let registry = self.registry.lock().await;
        registry.evaluations.values().filter(|consumer| !consumer.is_closed()).cloned().collect()
    }

    /// Mark the given evaluation as failed, releasing the booking of this subscriber.
    async fn fail_evaluation(&self, evaluation_id: &str, cause: &SubscriberError) {
        let consumer = self.registry.lock().await.evaluations.get(evaluation_id).cloned();
        match consumer {
            Some(consumer) => {
                if let Err(err) = consumer.mark_failed(cause).await {
                    tracing::error!(evaluation = evaluation_id, error = %err, "error notifying evaluation failure, will retry on sweep");
                }
                if consumer.is_closed() {
                    self.offerer.unbook(evaluation_id);
                }
            }
            None => {
                tracing::error!(evaluation = evaluation_id, error = %cause, "unrecoverable error for evaluation without a consumer");
                self.offerer.unbook(evaluation_id);
                self.registry.lock().await.retries.remove(evaluation_id);
            }
        }
    }

    /// Mark this subscriber as failed, along with every open evaluation, on a best effort basis.
    async fn mark_subscriber_failed(&self, cause: &SubscriberError) {
        tracing::error!(error = %cause, "subscriber failed unrecoverably, marking open evaluations as failed");
        self.status.mark_failed(cause.to_string());
        for consumer in self.open_evaluations().await {
            if let Err(err) = consumer.mark_failed(cause).await {
                tracing::warn!(evaluation = %consumer.evaluation_id(), error = %err, "error marking evaluation as failed");
            }
            if consumer.is_closed() {
                self.offerer.unbook(consumer.evaluation_id());
            }
        }
    }

    /// The retry counter of the given evaluation, along with its consumer if any.
    async fn retries(&self, evaluation_id: &str) -> (Option<Arc<EvaluationConsumer>>, Arc<AtomicU32>) {
        let mut registry = self.registry.lock().await;
        let consumer = registry.evaluations.get(evaluation_id).cloned();
        let (_, counter) = registry
            .retries
            .entry(evaluation_id.to_string())
            .or_insert_with(|| (Instant::now(), Default::default()));
        (consumer, counter.clone())
    }
}

/// The name of the subscription of the given topic.
fn subscription_name(config: &Config, topic: Topic) -> String {
    format!("{}-EXTERNAL-{}", config.subscriber_id, topic.name())
}
