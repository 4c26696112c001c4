//! Subscriber health and throughput.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

const METRIC_EVALUATIONS_STARTED: &str = "evaluation_subscriber_evaluations_started";
const METRIC_EVALUATIONS_COMPLETED: &str = "evaluation_subscriber_evaluations_completed";
const METRIC_EVALUATIONS_FAILED: &str = "evaluation_subscriber_evaluations_failed";
const METRIC_STATISTICS_CONSUMED: &str = "evaluation_subscriber_statistics_consumed";
const METRIC_EVALUATIONS_ACTIVE: &str = "evaluation_subscriber_evaluations_active";

/// Counters describing the health and throughput of a subscriber.
///
/// All counters are updated atomically, so a status may be shared freely and read at any time.
/// Each counter is mirrored to the `metrics` facade.
pub struct SubscriberStatus {
    subscriber_id: String,
    evaluations_started: AtomicU64,
    evaluations_completed: AtomicU64,
    evaluations_failed: AtomicU64,
    statistics_consumed: AtomicU64,
    evaluations_active: AtomicU64,
    max_concurrent_evaluations: AtomicU64,
    recent_evaluation: ArcSwapOption<String>,
    recent_statistics: ArcSwapOption<String>,
    failed: AtomicBool,
    failure_cause: ArcSwapOption<String>,
}

impl SubscriberStatus {
    /// Create a new instance for the given subscriber.
    pub fn new(subscriber_id: impl Into<String>) -> Self {
        metrics::register_counter!(METRIC_EVALUATIONS_STARTED, metrics::Unit::Count, "evaluations started by this subscriber");
        metrics::register_counter!(METRIC_EVALUATIONS_COMPLETED, metrics::Unit::Count, "evaluations consumed successfully");
        metrics::register_counter!(METRIC_EVALUATIONS_FAILED, metrics::Unit::Count, "evaluations which failed");
        metrics::register_counter!(METRIC_STATISTICS_CONSUMED, metrics::Unit::Count, "statistics messages consumed");
        metrics::register_gauge!(METRIC_EVALUATIONS_ACTIVE, metrics::Unit::Count, "evaluations currently open");
        Self {
            subscriber_id: subscriber_id.into(),
            evaluations_started: AtomicU64::new(0),
            evaluations_completed: AtomicU64::new(0),
            evaluations_failed: AtomicU64::new(0),
            statistics_consumed: AtomicU64::new(0),
            evaluations_active: AtomicU64::new(0),
            max_concurrent_evaluations: AtomicU64::new(0),
            recent_evaluation: ArcSwapOption::empty(),
            recent_statistics: ArcSwapOption::empty(),
            failed: AtomicBool::new(false),
            failure_cause: ArcSwapOption::empty(),
        }
    }

    /// Register the start of an evaluation.
    pub fn register_evaluation_started(&self, evaluation_id: &str) {
        self.evaluations_started.fetch_add(1, Ordering::SeqCst);
        let active = self.evaluations_active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_evaluations.fetch_max(active, Ordering::SeqCst);
        self.recent_evaluation.store(Some(Arc::new(evaluation_id.into())));
        metrics::increment_counter!(METRIC_EVALUATIONS_STARTED);
        metrics::gauge!(METRIC_EVALUATIONS_ACTIVE, active as f64);
    }

    /// Register the successful completion of an evaluation.
    pub fn register_evaluation_completed(&self, evaluation_id: &str) {
        self.evaluations_completed.fetch_add(1, Ordering::SeqCst);
        self.register_evaluation_finished(evaluation_id);
        metrics::increment_counter!(METRIC_EVALUATIONS_COMPLETED);
    }

    /// Register the failure of an evaluation.
    pub fn register_evaluation_failed(&self, evaluation_id: &str) {
        self.evaluations_failed.fetch_add(1, Ordering::SeqCst);
        self.register_evaluation_finished(evaluation_id);
        metrics::increment_counter!(METRIC_EVALUATIONS_FAILED);
    }

    fn register_evaluation_finished(&self, evaluation_id: &str) {
        let active = self
            .evaluations_active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |val| Some(val.saturating_sub(1)))
            .map(|prev| prev.saturating_sub(1))
            .unwrap_or_default();
        self.recent_evaluation.store(Some(Arc::new(evaluation_id.into())));
        metrics::gauge!(METRIC_EVALUATIONS_ACTIVE, active as f64);
    }

    /// Register the consumption of a statistics message.
    pub fn register_statistics(&self, message_id: &str) {
        self.statistics_consumed.fetch_add(1, Ordering::SeqCst);
        self.recent_statistics.store(Some(Arc::new(message_id.into())));
        metrics::increment_counter!(METRIC_STATISTICS_CONSUMED);
    }

    /// Mark the subscriber as failed unrecoverably. Only the first cause is retained.
    pub fn mark_failed(&self, cause: impl Into<String>) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            self.failure_cause.store(Some(Arc::new(cause.into())));
        }
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn failure_cause(&self) -> Option<Arc<String>> {
        self.failure_cause.load_full()
    }

    pub fn evaluations_started(&self) -> u64 {
        self.evaluations_started.load(Ordering::SeqCst)
    }

    pub fn evaluations_completed(&self) -> u64 {
        self.evaluations_completed.load(Ordering::SeqCst)
    }

    pub fn evaluations_failed(&self) -> u64 {
        self.evaluations_failed.load(Ordering::SeqCst)
    }

    pub fn statistics_consumed(&self) -> u64 {
        self.statistics_consumed.load(Ordering::SeqCst)
    }

    pub fn evaluations_active(&self) -> u64 {
        self.evaluations_active.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_evaluations(&self) -> u64 {
        self.max_concurrent_evaluations.load(Ordering::SeqCst)
    }

    pub fn recent_evaluation(&self) -> Option<Arc<String>> {
        self.recent_evaluation.load_full()
    }

    pub fn recent_statistics(&self) -> Option<Arc<String>> {
        self.recent_statistics.load_full()
    }
}

impl fmt::Display for SubscriberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subscriber {}: {} statistics consumed; {} evaluations started, {} completed, {} failed, {} active (max {})",
            self.subscriber_id,
            self.statistics_consumed(),
            self.evaluations_started(),
            self.evaluations_completed(),
            self.evaluations_failed(),
            self.evaluations_active(),
            self.max_concurrent_evaluations(),
        )?;
        if let Some(id) = self.recent_evaluation() {
            write!(f, "; most recent evaluation {}", id)?;
        }
        if let Some(id) = self.recent_statistics() {
            write!(f, "; most recent statistics {}", id)?;
        }
        if let Some(cause) = self.failure_cause() {
            write!(f, "; failed unrecoverably: {}", cause)?;
        }
        Ok(())
    }
}
