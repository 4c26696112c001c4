use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing_subscriber::prelude::*;

use crate::broker::{Broker, DeliveryResponse, MemoryBroker, MessageMetadata, MessagePublisher, SubscriptionSetup, Topic};
use crate::consumer::{ConsumeResult, ConsumerFactory, GroupedConsumer, IncrementalConsumer};
use crate::error::{ErrorKind, SubscriberError, SubscriberResult};
use crate::models::{CompletionStatus, ConsumerDescription, Evaluation, EvaluationStatus, Format, Statistics};
use crate::utils;

/// Install a tracing subscriber for tests, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _res = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().compact().with_test_writer())
        .try_init();
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

/// A consumer factory whose writers record what they consume.
///
/// Writers fail according to the queue of failures scripted with `fail_next`.
#[derive(Clone)]
pub struct RecordingFactory {
    pub consumer_id: String,
    pub formats: Vec<Format>,
    /// The pool labels of the statistics consumed incrementally, in order.
    pub incremental: Arc<Mutex<Vec<String>>>,
    /// The pool labels of each flushed group.
    pub grouped: Arc<Mutex<Vec<Vec<String>>>>,
    failures: Arc<Mutex<VecDeque<ErrorKind>>>,
}

impl RecordingFactory {
    pub fn new(consumer_id: &str, formats: &[Format]) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            formats: formats.to_vec(),
            incremental: Default::default(),
            grouped: Default::default(),
            failures: Default::default(),
        }
    }

    /// Fail the next writer invocation with an error of the given kind.
    pub fn fail_next(&self, kind: ErrorKind) {
        lock(&self.failures).push_back(kind);
    }

    pub fn incremental_pools(&self) -> Vec<String> {
        lock(&self.incremental).clone()
    }

    pub fn grouped_pools(&self) -> Vec<Vec<String>> {
        lock(&self.grouped).clone()
    }

    fn scripted_failure(failures: &Mutex<VecDeque<ErrorKind>>) -> SubscriberResult<()> {
        let err = anyhow!("scripted writer failure");
        match lock(failures).pop_front() {
            None => Ok(()),
            Some(ErrorKind::Retryable) => Err(SubscriberError::retryable(err)),
            Some(ErrorKind::EvaluationFatal) => Err(SubscriberError::evaluation(err)),
            Some(ErrorKind::SubscriberFatal) => Err(SubscriberError::subscriber(err)),
            Some(ErrorKind::ProtocolViolation) => Err(SubscriberError::protocol(err)),
        }
    }
}

impl ConsumerFactory for RecordingFactory {
    fn consumer(&self, _evaluation: &Evaluation, path: &Path) -> SubscriberResult<IncrementalConsumer> {
        let (path, records, failures) = (path.to_path_buf(), self.incremental.clone(), self.failures.clone());
        Ok(Arc::new(move |statistics: &Statistics| -> ConsumeResult {
            Self::scripted_failure(&failures)?;
            lock(&records).push(statistics.pool.clone());
            Ok(BTreeSet::from([path.join(format!("{}.csv", statistics.pool))]))
        }))
    }

    fn grouped_consumer(&self, _evaluation: &Evaluation, path: &Path) -> SubscriberResult<GroupedConsumer> {
        let (path, records) = (path.to_path_buf(), self.grouped.clone());
        Ok(Arc::new(move |statistics: Vec<Statistics>| -> ConsumeResult {
            let mut pools: Vec<_> = statistics.iter().map(|stats| stats.pool.clone()).collect();
            pools.sort();
            let group = statistics.first().map(|stats| stats.group.clone()).unwrap_or_default();
            lock(&records).push(pools);
            Ok(BTreeSet::from([path.join(format!("{}.png", group))]))
        }))
    }

    fn consumer_description(&self) -> ConsumerDescription {
        ConsumerDescription {
            consumer_id: self.consumer_id.clone(),
            formats: self.formats.iter().map(|format| *format as i32).collect(),
        }
    }
}

/// A publisher which records every status it publishes.
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(MessageMetadata, EvaluationStatus)>>,
    fail: AtomicBool,
}

impl RecordingPublisher {
    /// Cause all publications to fail, or succeed again.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(MessageMetadata, EvaluationStatus)> {
        lock(&self.published).clone()
    }

    /// The published statuses with the given completion status.
    pub fn statuses(&self, status: CompletionStatus) -> Vec<EvaluationStatus> {
        lock(&self.published)
            .iter()
            .filter(|(_, msg)| msg.completion_status() == status)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

#[async_trait]
impl MessagePublisher for RecordingPublisher {
    async fn publish(&self, metadata: MessageMetadata, body: Bytes) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("publisher connection unavailable");
        }
        let msg: EvaluationStatus = utils::decode_model(&body)?;
        lock(&self.published).push((metadata, msg));
        Ok(())
    }
}

/// An observer of the status topic of a memory broker, acknowledging every message.
pub struct StatusObserver {
    rx: mpsc::Receiver<(MessageMetadata, EvaluationStatus)>,
}

impl StatusObserver {
    pub async fn new(broker: &MemoryBroker, name: &str) -> Result<Self> {
        let mut deliveries = broker
            .subscribe(SubscriptionSetup {
                topic: Topic::Status,
                name: name.into(),
                durable: false,
            })
            .await?;
        let (tx, rx) = mpsc::channel(1000);
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                let _ = delivery.response.send(DeliveryResponse::Ack);
                if let Ok(msg) = utils::decode_model::<EvaluationStatus>(&delivery.body) {
                    if tx.send((delivery.metadata, msg)).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(Self { rx })
    }

    /// Await the next status published by a subscriber with the given completion status.
    pub async fn next_from_subscriber(&mut self, status: CompletionStatus) -> Result<(MessageMetadata, EvaluationStatus)> {
        let wait = async {
            while let Some((metadata, msg)) = self.rx.recv().await {
                if metadata.consumer_id.is_some() && msg.completion_status() == status {
                    return Ok((metadata, msg));
                }
            }
            Err(anyhow!("status topic closed"))
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .with_context(|| format!("timeout awaiting status {:?}", status))?
    }
}

/// Publish a message of the given model to the given topic.
pub async fn publish<M: prost::Message>(broker: &MemoryBroker, topic: Topic, metadata: MessageMetadata, model: &M) -> Result<()> {
    let body = utils::encode_model(model)?;
    broker.publisher(topic)?.publish(metadata, Bytes::from(body)).await
}

/// A minimal evaluation description requiring the given formats.
pub fn evaluation(formats: &[Format]) -> Evaluation {
    Evaluation {
        label: "streamflow verification".into(),
        formats: formats.iter().map(|format| *format as i32).collect(),
        measurement_unit: "CMS".into(),
    }
}

/// A statistics message of the given pool and group.
pub fn statistics(pool: &str, group: &str) -> Statistics {
    Statistics {
        pool: pool.into(),
        group: group.into(),
        data: pool.as_bytes().to_vec(),
    }
}

/// A status message as published by a producer.
pub fn producer_status(status: CompletionStatus, group_id: &str, count: u32) -> EvaluationStatus {
    let mut msg = EvaluationStatus::new(status, "producer");
    msg.group_id = group_id.into();
    msg.message_count = count;
    msg
}

/// The paths written beneath the given evaluation output directory.
pub fn output_path(base: &Path, evaluation_id: &str, file: &str) -> PathBuf {
    utils::evaluation_output_path(base, None, evaluation_id).join(file)
}
