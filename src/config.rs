//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The identity of this subscriber, which producers use to claim messages for it.
    ///
    /// A random identifier is generated when not given.
    #[serde(default = "Config::default_subscriber_id")]
    pub subscriber_id: String,

    /// The number of times a message is redelivered for an evaluation before the evaluation is
    /// marked as failed.
    #[serde(default = "Config::default_max_message_retries")]
    pub max_message_retries: u32,
    /// The delay before the first retry, in milliseconds; each later retry doubles the delay.
    #[serde(default = "Config::default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,

    /// A bool indicating if the subscriptions of this subscriber should be durable.
    #[serde(default = "Config::default_true")]
    pub durable_subscriptions: bool,
    /// A bool indicating if this subscriber books itself exclusively to one evaluation at a time.
    #[serde(default = "Config::default_true")]
    pub booking_enabled: bool,
    /// When set, this subscriber only offers its services to the identified evaluation.
    #[serde(default)]
    pub serve_evaluation: Option<String>,

    /// The number of format writer tasks which may run concurrently.
    #[serde(default = "Config::default_writer_threads")]
    pub writer_threads: usize,
    /// The directory beneath which each evaluation's outputs are written.
    #[serde(default = "std::env::temp_dir")]
    pub output_directory: PathBuf,

    /// The period between liveness notifications for open evaluations, in seconds.
    #[serde(default = "Config::default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,
    /// The period between sweeps of finished evaluations, in seconds.
    #[serde(default = "Config::default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// How long an evaluation may wait for its description message before it is failed, in seconds.
    #[serde(default = "Config::default_description_timeout_secs")]
    pub description_timeout_secs: u64,

    /// The maximum number of causes reported in a failure notification.
    #[serde(default = "Config::default_max_cause_levels")]
    pub max_cause_levels: usize,
    /// Restrictions on which subscribers may deliver which formats, as
    /// `FORMAT=id1,id2;FORMAT=id3`. Formats without a restriction are open to all.
    #[serde(default)]
    pub format_approvals: Option<String>,
}

impl Config {
    /// Create a new config instance.
    ///
    /// This parses the runtime environment and builds the application config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Check config invariants which serde can not express.
    pub fn validate(&self) -> Result<()> {
        if self.subscriber_id.trim().is_empty() {
            anyhow::bail!("SUBSCRIBER_ID may not be an empty string");
        }
        if self.writer_threads == 0 {
            anyhow::bail!("WRITER_THREADS must be greater than 0");
        }
        if self.max_cause_levels == 0 {
            anyhow::bail!("MAX_CAUSE_LEVELS must be greater than 0");
        }
        Ok(())
    }

    /// The delay to apply before the given retry attempt (0-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.retry_backoff_base_ms.saturating_mul(factor))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn description_timeout(&self) -> Duration {
        Duration::from_secs(self.description_timeout_secs)
    }

    fn default_subscriber_id() -> String {
        crate::utils::new_id()
    }

    fn default_max_message_retries() -> u32 {
        2
    }

    fn default_retry_backoff_base_ms() -> u64 {
        1000
    }

    fn default_true() -> bool {
        true
    }

    fn default_writer_threads() -> usize {
        4
    }

    fn default_liveness_interval_secs() -> u64 {
        5
    }

    fn default_sweep_interval_secs() -> u64 {
        60
    }

    fn default_description_timeout_secs() -> u64 {
        600
    }

    fn default_max_cause_levels() -> usize {
        5
    }

    /// A config suitable for tests, writing outputs beneath a temporary directory.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let config: Config = envy::from_iter(vec![
            ("SUBSCRIBER_ID".to_string(), "test-subscriber".to_string()),
            ("RETRY_BACKOFF_BASE_MS".to_string(), "1".to_string()),
            ("OUTPUT_DIRECTORY".to_string(), tmpdir.path().to_string_lossy().to_string()),
        ])
        .context("error building test config")?;
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
