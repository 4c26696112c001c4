//! Subscriber error abstractions.

use std::fmt;

// Error messages.
pub const ERR_PUBLISH_STATUS: &str = "error publishing evaluation status message";
pub const ERR_WRITER_POOL_CLOSED: &str = "the writer pool has been closed";

/// The classification of an error, which decides how far its effects reach.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A transient error; the message is redelivered up to the configured retry limit.
    Retryable,
    /// No further progress is possible on the evaluation; it is marked failed immediately.
    EvaluationFatal,
    /// The subscriber itself cannot be trusted to continue.
    SubscriberFatal,
    /// A producer or caller has broken the messaging contract; never retried.
    ProtocolViolation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::EvaluationFatal => write!(f, "evaluation fatal"),
            Self::SubscriberFatal => write!(f, "subscriber fatal"),
            Self::ProtocolViolation => write!(f, "protocol violation"),
        }
    }
}

/// The error type used throughout the subscriber.
///
/// Each variant wraps the full context chain of the underlying error, which is surfaced to
/// producers as the status events of a failure notification.
#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    /// A transient failure, see `ErrorKind::Retryable`.
    #[error("recoverable consumption error: {0}")]
    Retryable(anyhow::Error),
    /// An unrecoverable evaluation failure, see `ErrorKind::EvaluationFatal`.
    #[error("unrecoverable evaluation error: {0}")]
    Evaluation(anyhow::Error),
    /// An unrecoverable subscriber failure, see `ErrorKind::SubscriberFatal`.
    #[error("unrecoverable subscriber error: {0}")]
    Subscriber(anyhow::Error),
    /// A protocol violation, see `ErrorKind::ProtocolViolation`.
    #[error("protocol violation: {0}")]
    Protocol(anyhow::Error),
}

impl SubscriberError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    pub fn evaluation(err: impl Into<anyhow::Error>) -> Self {
        Self::Evaluation(err.into())
    }

    pub fn subscriber(err: impl Into<anyhow::Error>) -> Self {
        Self::Subscriber(err.into())
    }

    pub fn protocol(err: impl Into<anyhow::Error>) -> Self {
        Self::Protocol(err.into())
    }

    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Retryable(_) => ErrorKind::Retryable,
            Self::Evaluation(_) => ErrorKind::EvaluationFatal,
            Self::Subscriber(_) => ErrorKind::SubscriberFatal,
            Self::Protocol(_) => ErrorKind::ProtocolViolation,
        }
    }

    /// The underlying error along with its context chain.
    pub fn cause(&self) -> &anyhow::Error {
        match self {
            Self::Retryable(err) | Self::Evaluation(err) | Self::Subscriber(err) | Self::Protocol(err) => err,
        }
    }

    /// Render this error and its causes as one message per level, outermost first, capped at
    /// `max_levels` entries.
    pub fn cause_chain(&self, max_levels: usize) -> Vec<String> {
        std::iter::once(self.to_string())
            .chain(self.cause().chain().skip(1).map(|cause| cause.to_string()))
            .take(max_levels)
            .collect()
    }
}

/// A result type where the error is a `SubscriberError`.
pub type SubscriberResult<T> = ::std::result::Result<T, SubscriberError>;
