//! The negotiation of evaluation ownership between producers and subscribers.
//!
//! When a producer requests a consumer for an evaluation, each subscriber able to deliver one of
//! the required formats offers its services. The producer then claims the formats of its messages
//! for the subscribers it has chosen.

mod approver;
mod offerer;

pub use approver::SubscriberApprover;
pub use offerer::{Booking, SubscriberOfferer};
