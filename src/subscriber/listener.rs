use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::broker::{Delivery, DeliveryResponse, MessageMetadata, Topic};
use crate::consumer::EvaluationConsumer;
use crate::error::{ErrorKind, SubscriberError, SubscriberResult};
use crate::models::{CompletionStatus, Evaluation, EvaluationStatus, Format, Statistics};
use crate::subscriber::SubscriberCore;
use crate::utils;

/// A task consuming the deliveries of one topic.
pub(super) struct Listener {
    core: Arc<SubscriberCore>,
    topic: Topic,
    deliveries: ReceiverStream<Delivery>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl Listener {
    pub(super) fn new(core: Arc<SubscriberCore>, topic: Topic, deliveries: mpsc::Receiver<Delivery>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            core,
            topic,
            deliveries: ReceiverStream::new(deliveries),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        }
    }

    pub(super) fn spawn(self) -> JoinHandle<SubscriberResult<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> SubscriberResult<()> {
        tracing::debug!(topic = %self.topic, "listener has started");

        loop {
            tokio::select! {
                delivery = self.deliveries.next() => match delivery {
                    Some(delivery) => {
                        if let Err(err) = self.handle_delivery(delivery).await {
                            let _ = self.shutdown_tx.send(());
                            return Err(err);
                        }
                    }
                    None if self.core.closing.load(Ordering::SeqCst) => break,
                    None => {
                        let err = SubscriberError::subscriber(anyhow!("the {} subscription was closed by the broker", self.topic));
                        self.core.mark_subscriber_failed(&err).await;
                        let _ = self.shutdown_tx.send(());
                        return Err(err);
                    }
                },
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!(topic = %self.topic, "listener has shutdown");
        Ok(())
    }

    /// Handle a delivery, classifying any error to decide the response.
    ///
    /// Only a subscriber fatal error escapes, in which case the delivery is left unanswered.
    #[tracing::instrument(level = "debug", skip(self, delivery), fields(topic = %self.topic, message = ?delivery.metadata.message_id))]
    async fn handle_delivery(&mut self, delivery: Delivery) -> SubscriberResult<()> {
        let Delivery { metadata, body, response } = delivery;
        let outcome = match self.topic {
            Topic::Status => self.core.process_status(&metadata, body).await,
            Topic::Evaluation => self.core.process_evaluation(&metadata, body).await,
            Topic::Statistics => self.core.process_statistics(&metadata, body).await,
        };
        let err = match outcome {
            Ok(()) => {
                let _ = response.send(DeliveryResponse::Ack);
                return Ok(());
            }
            Err(err) => err,
        };

        let evaluation_id = metadata.correlation_id.as_deref().unwrap_or_default();
        let reply = match err.kind() {
            ErrorKind::Retryable => self.core.recover(evaluation_id, &err).await,
            ErrorKind::EvaluationFatal | ErrorKind::ProtocolViolation => {
                tracing::error!(evaluation = evaluation_id, kind = %err.kind(), error = %err, "unrecoverable error consuming evaluation");
                self.core.fail_evaluation(evaluation_id, &err).await;
                DeliveryResponse::Ack
            }
            ErrorKind::SubscriberFatal => {
                self.core.mark_subscriber_failed(&err).await;
                drop(response);
                return Err(err);
            }
        };
        let _ = response.send(reply);
        Ok(())
    }
}

impl SubscriberCore {
    /// Decide how to respond to a retryable error.
    ///
    /// While the evaluation and this subscriber are healthy and retries remain, wait for an
    /// exponentially increasing backoff and request redelivery. Otherwise, the evaluation is
    /// marked failed and the message acknowledged, as no redelivery will follow.
    pub(super) async fn recover(&self, evaluation_id: &str, err: &SubscriberError) -> DeliveryResponse {
        let (consumer, retries) = self.retries(evaluation_id).await;
        // Claim the attempt before backing off, so concurrent failures never share a slot.
        let attempts = retries.fetch_add(1, Ordering::SeqCst);
        let max = self.config.max_message_retries;
        let healthy = !self.status.is_failed() && !consumer.as_ref().map(|consumer| consumer.is_failed()).unwrap_or(false);
        if healthy && attempts < max {
            let delay = self.config.retry_backoff(attempts);
            tracing::error!(
                evaluation = evaluation_id,
                attempt = attempts + 1,
                max,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "recoverable error consuming evaluation, requesting redelivery after backoff"
            );
            tokio::time::sleep(delay).await;
            return DeliveryResponse::Recover;
        }

        tracing::error!(evaluation = evaluation_id, attempts, error = %err, "retries exhausted for evaluation");
        self.fail_evaluation(evaluation_id, err).await;
        DeliveryResponse::Ack
    }

    /// The message and evaluation ids of a message, if it carries both.
    fn required_ids<'a>(&self, metadata: &'a MessageMetadata) -> Option<(&'a str, &'a str)> {
        match (metadata.message_id.as_deref(), metadata.correlation_id.as_deref()) {
            (Some(message_id), Some(evaluation_id)) if !message_id.is_empty() && !evaluation_id.is_empty() => Some((message_id, evaluation_id)),
            _ => {
                tracing::debug!(?metadata, "ignoring message without message id or evaluation id");
                None
            }
        }
    }

    /// Resolve the consumer of a message, if the message is for this subscriber.
    ///
    /// A message is for this subscriber when it is claimed by it, this subscriber has not failed,
    /// and its evaluation has not failed. A message claimed by another subscriber releases any
    /// booking this subscriber holds for the evaluation.
    async fn claimed_consumer(&self, metadata: &MessageMetadata, evaluation_id: &str) -> Option<Arc<EvaluationConsumer>> {
        if self.status.is_failed() {
            return None;
        }
        if !metadata.is_claimed_by(&self.config.subscriber_id) {
            if metadata.is_claimed() {
                self.release_lost_booking(evaluation_id).await;
            }
            return None;
        }
        self.get_or_create(evaluation_id).await
    }

    /// Release the booking of an evaluation which is being served by another subscriber.
    async fn release_lost_booking(&self, evaluation_id: &str) {
        if !self.offerer.is_booked_by(evaluation_id) {
            return;
        }
        if self.registry.lock().await.evaluations.contains_key(evaluation_id) {
            return;
        }
        if self.offerer.unbook(evaluation_id) {
            tracing::info!(evaluation = evaluation_id, "evaluation claimed by another subscriber, booking released");
        }
    }

    #[tracing::instrument(level = "trace", skip(self, metadata, body))]
    pub(super) async fn process_status(&self, metadata: &MessageMetadata, body: Bytes) -> SubscriberResult<()> {
        // Status messages published by subscribers, including this one, are not for consumption.
        if metadata.consumer_id.is_some() || self.status.is_failed() {
            return Ok(());
        }
        let (message_id, evaluation_id) = match self.required_ids(metadata) {
            Some(ids) => ids,
            None => return Ok(()),
        };
        let status: EvaluationStatus = utils::decode_model(&body).map_err(SubscriberError::retryable)?;

        if status.completion_status() == CompletionStatus::ConsumerRequired {
            let formats: Vec<Format> = status.formats_required().collect();
            self.offerer.offer_services(&formats, evaluation_id).await?;
            return Ok(());
        }
        if !metadata.is_claimed_by(&self.config.subscriber_id) && status.completion_status().is_producer_failure() {
            self.release_lost_booking(evaluation_id).await;
            return Ok(());
        }

        let consumer = match self.claimed_consumer(metadata, evaluation_id).await {
            Some(consumer) => consumer,
            None => return Ok(()),
        };
        consumer.accept_status(&status, message_id).await?;
        self.after_message(&consumer).await
    }

    #[tracing::instrument(level = "trace", skip(self, metadata, body))]
    pub(super) async fn process_evaluation(&self, metadata: &MessageMetadata, body: Bytes) -> SubscriberResult<()> {
        let (message_id, evaluation_id) = match self.required_ids(metadata) {
            Some(ids) => ids,
            None => return Ok(()),
        };
        let consumer = match self.claimed_consumer(metadata, evaluation_id).await {
            Some(consumer) => consumer,
            None => return Ok(()),
        };
        let evaluation: Evaluation = utils::decode_model(&body).map_err(SubscriberError::retryable)?;
        consumer
            .accept_evaluation_description(&evaluation, message_id, metadata.job_id.as_deref())
            .await?;
        self.after_message(&consumer).await
    }

    #[tracing::instrument(level = "trace", skip(self, metadata, body))]
    pub(super) async fn process_statistics(&self, metadata: &MessageMetadata, body: Bytes) -> SubscriberResult<()> {
        let (message_id, evaluation_id) = match self.required_ids(metadata) {
            Some(ids) => ids,
            None => return Ok(()),
        };
        let consumer = match self.claimed_consumer(metadata, evaluation_id).await {
            Some(consumer) => consumer,
            None => return Ok(()),
        };
        let statistics: Statistics = utils::decode_model(&body).map_err(SubscriberError::retryable)?;
        let group_id = metadata
            .group_id
            .clone()
            .filter(|group| !group.is_empty())
            .or_else(|| Some(statistics.group.clone()).filter(|group| !group.is_empty()));
        consumer.accept_statistics(statistics, group_id.as_deref(), message_id).await?;
        self.after_message(&consumer).await
    }

    /// Close the evaluation if it has been consumed, releasing the booking once closed.
    async fn after_message(&self, consumer: &EvaluationConsumer) -> SubscriberResult<()> {
        if consumer.is_complete() && !consumer.is_failed() && !consumer.is_closed() {
            consumer.mark_succeeded().await?;
        }
        if consumer.is_closed() {
            self.offerer.unbook(consumer.evaluation_id());
        }
        Ok(())
    }
}
