//! The message transport seam.
//!
//! A `Broker` provides the three logical streams over which evaluations are coordinated. Every
//! inbound message is handed to the subscriber as a `Delivery`, which must be responded to with
//! either an `Ack` or a `Recover`. A delivery whose response channel is dropped is treated by the
//! broker as not acknowledged.

mod memory;
#[cfg(test)]
mod memory_test;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

pub use memory::MemoryBroker;

/// The logical message streams of an evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Evaluation status messages, published by producers and subscribers.
    Status,
    /// Evaluation description messages.
    Evaluation,
    /// Statistics messages.
    Statistics,
}

impl Topic {
    /// The name of this topic.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Evaluation => "evaluation",
            Self::Statistics => "statistics",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The metadata attached to a message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    /// The unique id of the message.
    pub message_id: Option<String>,
    /// The id of the evaluation to which the message belongs.
    pub correlation_id: Option<String>,
    /// The id of the subscriber which sent the message, if sent by a subscriber.
    pub consumer_id: Option<String>,
    /// The message group of a statistics message, if any.
    pub group_id: Option<String>,
    /// The id of the job which requested the evaluation, if any.
    pub job_id: Option<String>,
    /// A mapping of format names to the subscriber which has been awarded that format.
    pub claims: HashMap<String, String>,
}

impl MessageMetadata {
    /// Create metadata for a message of the given evaluation.
    pub fn new(message_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            message_id: Some(message_id.into()),
            correlation_id: Some(correlation_id.into()),
            ..Default::default()
        }
    }

    /// Claim the given format for the given subscriber.
    pub fn with_claim(mut self, format: &str, subscriber_id: &str) -> Self {
        self.claims.insert(format.into(), subscriber_id.into());
        self
    }

    /// Set the message group of this message.
    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Check if any format of this message has been claimed by the given subscriber.
    pub fn is_claimed_by(&self, subscriber_id: &str) -> bool {
        self.claims.values().any(|id| id == subscriber_id)
    }

    /// Check if any format of this message has been claimed at all.
    pub fn is_claimed(&self) -> bool {
        !self.claims.is_empty()
    }
}

/// The response to a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryResponse {
    /// The message was handled and must not be delivered again.
    Ack,
    /// Request redelivery of the message.
    Recover,
}

/// A message delivered from a broker subscription.
#[derive(Debug)]
pub struct Delivery {
    pub metadata: MessageMetadata,
    pub body: Bytes,
    pub response: oneshot::Sender<DeliveryResponse>,
}

/// The setup of a broker subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionSetup {
    /// The topic to subscribe to.
    pub topic: Topic,
    /// The name of the subscription.
    pub name: String,
    /// A bool indicating if the subscription should outlive its subscriber.
    pub durable: bool,
}

/// A type capable of providing message streams.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Open a subscription, returning the channel over which its messages are delivered.
    async fn subscribe(&self, setup: SubscriptionSetup) -> Result<mpsc::Receiver<Delivery>>;

    /// Remove the named subscription from the given topic.
    async fn unsubscribe(&self, topic: Topic, name: &str) -> Result<()>;

    /// Get a publisher for the given topic.
    fn publisher(&self, topic: Topic) -> Result<Arc<dyn MessagePublisher>>;
}

/// A type capable of publishing messages to a topic.
#[async_trait]
pub trait MessagePublisher: Send + Sync + 'static {
    /// Publish the given message body with the given metadata.
    async fn publish(&self, metadata: MessageMetadata, body: Bytes) -> Result<()>;
}
