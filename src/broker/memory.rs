//! An in-process broker.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::broker::{Broker, Delivery, DeliveryResponse, MessageMetadata, MessagePublisher, SubscriptionSetup, Topic};

/// The default number of redeliveries before a message is dead-lettered.
const DEFAULT_MAX_REDELIVERIES: u32 = 6;

/// A message in flight.
#[derive(Clone, Debug)]
struct Envelope {
    metadata: MessageMetadata,
    body: Bytes,
}

/// A subscription of a topic.
struct SubscriptionHandle {
    name: String,
    queue: mpsc::UnboundedSender<Envelope>,
}

/// An in-process broker delivering messages to each subscription of a topic.
///
/// Each subscription delivers its messages one at a time, awaiting the response to a delivery
/// before moving on. A message which is not acknowledged is redelivered up to the configured
/// maximum, after which it is moved to the dead letters.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<MemoryBrokerInner>,
}

struct MemoryBrokerInner {
    subscriptions: Mutex<HashMap<Topic, Vec<SubscriptionHandle>>>,
    dead_letters: Mutex<Vec<(Topic, MessageMetadata, Bytes)>>,
    max_redeliveries: u32,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REDELIVERIES)
    }
}

impl MemoryBroker {
    /// Create a new instance which redelivers unacknowledged messages up to `max_redeliveries` times.
    pub fn new(max_redeliveries: u32) -> Self {
        Self {
            inner: Arc::new(MemoryBrokerInner {
                subscriptions: Default::default(),
                dead_letters: Default::default(),
                max_redeliveries,
            }),
        }
    }

    /// The messages which exhausted their redeliveries.
    pub async fn dead_letters(&self) -> Vec<(Topic, MessageMetadata, Bytes)> {
        self.inner.dead_letters.lock().await.clone()
    }

    /// The names of the live subscriptions of the given topic.
    pub async fn subscriptions(&self, topic: Topic) -> Vec<String> {
        let subs = self.inner.subscriptions.lock().await;
        subs.get(&topic)
            .map(|handles| handles.iter().filter(|h| !h.queue.is_closed()).map(|h| h.name.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn subscribe(&self, setup: SubscriptionSetup) -> Result<mpsc::Receiver<Delivery>> {
        let mut subs = self.inner.subscriptions.lock().await;
        let handles = subs.entry(setup.topic).or_default();
        handles.retain(|h| !h.queue.is_closed());
        if handles.iter().any(|h| h.name == setup.name) {
            bail!("subscription {} already exists on topic {}", setup.name, setup.topic);
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (deliveries_tx, deliveries_rx) = mpsc::channel(1);
        handles.push(SubscriptionHandle {
            name: setup.name.clone(),
            queue: queue_tx,
        });
        tokio::spawn(deliver(self.inner.clone(), setup, queue_rx, deliveries_tx));
        Ok(deliveries_rx)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn unsubscribe(&self, topic: Topic, name: &str) -> Result<()> {
        let mut subs = self.inner.subscriptions.lock().await;
        if let Some(handles) = subs.get_mut(&topic) {
            handles.retain(|h| h.name != name);
        }
        Ok(())
    }

    fn publisher(&self, topic: Topic) -> Result<Arc<dyn MessagePublisher>> {
        Ok(Arc::new(MemoryPublisher {
            topic,
            inner: self.inner.clone(),
        }))
    }
}

/// Deliver the queued messages of one subscription.
async fn deliver(inner: Arc<MemoryBrokerInner>, setup: SubscriptionSetup, mut queue: mpsc::UnboundedReceiver<Envelope>, deliveries: mpsc::Sender<Delivery>) {
    tracing::debug!(topic = %setup.topic, name = %setup.name, "memory subscription started");
    'messages: while let Some(envelope) = queue.recv().await {
        let mut redeliveries = 0;
        loop {
            let (tx, rx) = oneshot::channel();
            let delivery = Delivery {
                metadata: envelope.metadata.clone(),
                body: envelope.body.clone(),
                response: tx,
            };
            if deliveries.send(delivery).await.is_err() {
                break 'messages;
            }
            match rx.await {
                Ok(DeliveryResponse::Ack) => break,
                Ok(DeliveryResponse::Recover) | Err(_) => {
                    if redeliveries >= inner.max_redeliveries {
                        tracing::warn!(topic = %setup.topic, name = %setup.name, message = ?envelope.metadata.message_id, "message redeliveries exhausted, moving to dead letters");
                        inner.dead_letters.lock().await.push((setup.topic, envelope.metadata, envelope.body));
                        break;
                    }
                    redeliveries += 1;
                }
            }
        }
    }
    tracing::debug!(topic = %setup.topic, name = %setup.name, "memory subscription closed");
}

/// A publisher of one topic of a `MemoryBroker`.
struct MemoryPublisher {
    topic: Topic,
    inner: Arc<MemoryBrokerInner>,
}

#[async_trait]
impl MessagePublisher for MemoryPublisher {
    #[tracing::instrument(level = "trace", skip(self, metadata, body))]
    async fn publish(&self, metadata: MessageMetadata, body: Bytes) -> Result<()> {
        let mut subs = self.inner.subscriptions.lock().await;
        if let Some(handles) = subs.get_mut(&self.topic) {
            handles.retain(|h| !h.queue.is_closed());
            for handle in handles.iter() {
                let _res = handle.queue.send(Envelope {
                    metadata: metadata.clone(),
                    body: body.clone(),
                });
            }
        }
        Ok(())
    }
}
