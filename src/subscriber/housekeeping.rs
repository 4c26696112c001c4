use std::sync::Arc;

use anyhow::anyhow;
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

use crate::error::{SubscriberError, SubscriberResult};
use crate::subscriber::SubscriberCore;

/// A task publishing liveness notices and sweeping the evaluation registry.
pub(super) struct Housekeeper {
    core: Arc<SubscriberCore>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl Housekeeper {
    pub(super) fn new(core: Arc<SubscriberCore>, shutdown_rx: broadcast::Receiver<()>) -> Self {
        Self {
            core,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
        }
    }

    pub(super) fn spawn(self) -> JoinHandle<SubscriberResult<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> SubscriberResult<()> {
        tracing::debug!("housekeeper has started");
        let mut liveness = IntervalStream::new(tokio::time::interval(self.core.config.liveness_interval()));
        let mut sweep = IntervalStream::new(tokio::time::interval(self.core.config.sweep_interval()));

        loop {
            tokio::select! {
                Some(_) = liveness.next() => self.notify_alive().await,
                Some(_) = sweep.next() => self.sweep().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("housekeeper has shutdown");
        Ok(())
    }

    /// Publish the consumption state of every open evaluation.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn notify_alive(&self) {
        if self.core.status.is_failed() {
            return;
        }
        for consumer in self.core.open_evaluations().await {
            if let Err(err) = consumer.notify_alive().await {
                tracing::warn!(evaluation = %consumer.evaluation_id(), error = %err, "error publishing liveness notice");
            }
        }
    }

    /// Sweep the evaluation registry.
    ///
    /// Evaluations whose description never arrived are failed, failure notices which could not
    /// be published are retried, and evaluations closed successfully are retired.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn sweep(&self) {
        let timeout = self.core.config.description_timeout();
        for consumer in self.core.open_evaluations().await {
            if consumer.is_failed() {
                if let Err(err) = consumer.close().await {
                    tracing::warn!(evaluation = %consumer.evaluation_id(), error = %err, "error publishing evaluation failure, will retry");
                    continue;
                }
            } else if !consumer.is_ready() && consumer.age() > timeout {
                let err = SubscriberError::evaluation(anyhow!(
                    "no evaluation description received within {}s of the first message",
                    timeout.as_secs()
                ));
                if let Err(err) = consumer.mark_failed(&err).await {
                    tracing::warn!(evaluation = %consumer.evaluation_id(), error = %err, "error publishing evaluation failure, will retry");
                    continue;
                }
            }
            if consumer.is_closed() {
                self.core.offerer.unbook(consumer.evaluation_id());
            }
        }

        let mut registry = self.core.registry.lock().await;
        let retired: Vec<String> = registry
            .evaluations
            .iter()
            .filter(|(_, consumer)| consumer.is_closed() && !consumer.is_failed())
            .map(|(id, _)| id.clone())
            .collect();
        for id in retired {
            registry.retire(&id);
            tracing::debug!(evaluation = %id, "retired evaluation consumer");
        }

        // Retry counters are dropped once their evaluation is closed, or once they have outlived
        // the description timeout without a consumer ever being created.
        let registry = &mut *registry;
        let evaluations = &registry.evaluations;
        registry.retries.retain(|id, (started, _)| match evaluations.get(id) {
            Some(consumer) => !consumer.is_closed(),
            None => started.elapsed() < timeout,
        });
    }
}
