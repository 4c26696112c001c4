//! The evaluation subscriber runtime.
//!
//! A subscriber listens to three message streams published for each evaluation: evaluation
//! descriptions, evaluation status and statistics. It negotiates ownership of evaluations with
//! producers, routes each claimed message to the `EvaluationConsumer` of its evaluation, and
//! reports consumption progress, completion and failure back over the status stream.
//!
//! Format writers are supplied by the embedding application through a `ConsumerFactory`, and the
//! message transport through a `Broker`.

pub mod broker;
pub mod config;
#[cfg(test)]
mod config_test;
pub mod consumer;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod models;
pub mod negotiation;
pub mod pool;
pub mod status;
pub mod subscriber;
mod utils;

pub use crate::broker::{Broker, Delivery, DeliveryResponse, MemoryBroker, MessageMetadata, MessagePublisher, SubscriptionSetup, Topic};
pub use crate::config::Config;
pub use crate::consumer::{ConsumeResult, ConsumerFactory, EvaluationConsumer, GroupConsumer, GroupedConsumer, IncrementalConsumer};
pub use crate::error::{ErrorKind, SubscriberError, SubscriberResult};
pub use crate::negotiation::{Booking, SubscriberApprover, SubscriberOfferer};
pub use crate::pool::WriterPool;
pub use crate::status::SubscriberStatus;
pub use crate::subscriber::Subscriber;
