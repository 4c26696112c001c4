use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwapOption;
use bytes::Bytes;

use crate::broker::{MessageMetadata, MessagePublisher};
use crate::config::Config;
use crate::error::{SubscriberError, SubscriberResult, ERR_PUBLISH_STATUS};
use crate::models::{CompletionStatus, ConsumerDescription, EvaluationStatus, Format};
use crate::negotiation::SubscriberApprover;
use crate::utils;

/// The outcome of an attempt to book a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Booking {
    /// This attempt took the booking slot.
    Booked,
    /// The slot was already held by the same evaluation.
    AlreadyHeld,
    /// The slot is held by another evaluation.
    Refused,
}

impl Booking {
    /// Check if the evaluation holds the booking after this attempt.
    pub fn is_held(&self) -> bool {
        !matches!(self, Self::Refused)
    }
}

/// The party which offers the services of a subscriber to evaluations requiring a consumer.
///
/// When booking is enabled, a subscriber serves at most one evaluation at a time: an offer is only
/// made once the offerer has booked itself to the evaluation, and the booking must be released
/// once the evaluation succeeds, fails, or is lost to another subscriber.
pub struct SubscriberOfferer {
    description: ConsumerDescription,
    publisher: Arc<dyn MessagePublisher>,
    approver: SubscriberApprover,
    evaluation_to_serve: Option<String>,
    booking_enabled: bool,
    booked: ArcSwapOption<String>,
}

impl SubscriberOfferer {
    /// Create a new instance.
    pub fn new(description: ConsumerDescription, publisher: Arc<dyn MessagePublisher>, approver: SubscriberApprover, config: &Config) -> Self {
        Self {
            description,
            publisher,
            approver,
            evaluation_to_serve: config.serve_evaluation.clone(),
            booking_enabled: config.booking_enabled,
            booked: ArcSwapOption::empty(),
        }
    }

    /// Offer the services of this subscriber to the given evaluation, if it can serve it.
    ///
    /// Returns true if an offer was published. An empty list of required formats accepts any
    /// format.
    #[tracing::instrument(level = "debug", skip(self, formats_required))]
    pub async fn offer_services(&self, formats_required: &[Format], evaluation_id: &str) -> SubscriberResult<bool> {
        if let Some(serve) = self.evaluation_to_serve.as_deref() {
            if serve != evaluation_id {
                tracing::debug!(evaluation = evaluation_id, serving = serve, "not offering services, subscriber is reserved for another evaluation");
                return Ok(false);
            }
        }
        if !self.can_serve(formats_required) {
            tracing::debug!(evaluation = evaluation_id, required = ?formats_required, "not offering services, no required format can be delivered");
            return Ok(false);
        }
        let booking = self.book(evaluation_id);
        if !booking.is_held() {
            tracing::debug!(evaluation = evaluation_id, booked = ?self.booked(), "not offering services, subscriber is booked");
            return Ok(false);
        }

        let consumer_id = self.description.consumer_id.clone();
        let mut msg = EvaluationStatus::new(CompletionStatus::ReadyToConsume, consumer_id.as_str());
        msg.consumer = Some(self.description.clone());
        let metadata = MessageMetadata {
            message_id: Some(utils::new_message_id(&consumer_id)),
            correlation_id: Some(evaluation_id.to_string()),
            consumer_id: Some(consumer_id),
            ..Default::default()
        };
        let published = match utils::encode_model(&msg) {
            Ok(body) => self.publisher.publish(metadata, Bytes::from(body)).await.context(ERR_PUBLISH_STATUS),
            Err(err) => Err(err),
        };
        if let Err(err) = published {
            // A booking held before this offer belongs to an evaluation already being served.
            if booking == Booking::Booked {
                self.unbook(evaluation_id);
            }
            return Err(SubscriberError::retryable(err));
        }
        tracing::info!(evaluation = evaluation_id, "offered services to evaluation");
        Ok(true)
    }

    /// Check if this subscriber may deliver any of the required formats.
    fn can_serve(&self, formats_required: &[Format]) -> bool {
        if formats_required.is_empty() {
            return true;
        }
        let consumer_id = self.description.consumer_id.as_str();
        self.description
            .formats()
            .any(|format| formats_required.contains(&format) && self.approver.is_approved(format, consumer_id))
    }

    /// Book this subscriber to the given evaluation.
    ///
    /// Takes the booking slot if it was empty, and always succeeds when booking is disabled.
    pub fn book(&self, evaluation_id: &str) -> Booking {
        if !self.booking_enabled {
            return Booking::Booked;
        }
        let prev = self.booked.compare_and_swap(&None::<Arc<String>>, Some(Arc::new(evaluation_id.to_string())));
        match &*prev {
            None => {
                tracing::debug!(evaluation = evaluation_id, "subscriber booked");
                Booking::Booked
            }
            Some(holder) if holder.as_str() == evaluation_id => Booking::AlreadyHeld,
            Some(_) => Booking::Refused,
        }
    }

    /// Release the booking of the given evaluation.
    ///
    /// Returns true if the evaluation held the booking. Releasing a booking held by another
    /// evaluation has no effect.
    pub fn unbook(&self, evaluation_id: &str) -> bool {
        if !self.booking_enabled {
            return true;
        }
        let current = self.booked.load_full();
        let holder = match &current {
            Some(holder) if holder.as_str() == evaluation_id => holder.clone(),
            _ => return false,
        };
        let prev = self.booked.compare_and_swap(&current, None);
        let released = matches!(&*prev, Some(prev) if Arc::ptr_eq(prev, &holder));
        if released {
            tracing::debug!(evaluation = evaluation_id, "subscriber booking released");
        }
        released
    }

    /// The evaluation currently holding the booking, if any.
    pub fn booked(&self) -> Option<Arc<String>> {
        self.booked.load_full()
    }

    /// Check if this subscriber has been booked by the given evaluation.
    pub fn is_booked_by(&self, evaluation_id: &str) -> bool {
        self.booked().map(|holder| holder.as_str() == evaluation_id).unwrap_or(false)
    }
}
