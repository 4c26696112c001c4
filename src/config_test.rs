use std::path::Path;

use anyhow::Result;

use super::*;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("SUBSCRIBER_ID".into(), "writer-0".into()),
        ("MAX_MESSAGE_RETRIES".into(), "4".into()),
        ("RETRY_BACKOFF_BASE_MS".into(), "250".into()),
        ("DURABLE_SUBSCRIPTIONS".into(), "false".into()),
        ("BOOKING_ENABLED".into(), "false".into()),
        ("SERVE_EVALUATION".into(), "ev1".into()),
        ("WRITER_THREADS".into(), "8".into()),
        ("OUTPUT_DIRECTORY".into(), "/var/lib/evaluations".into()),
        ("LIVENESS_INTERVAL_SECS".into(), "10".into()),
        ("SWEEP_INTERVAL_SECS".into(), "30".into()),
        ("DESCRIPTION_TIMEOUT_SECS".into(), "120".into()),
        ("MAX_CAUSE_LEVELS".into(), "3".into()),
        ("FORMAT_APPROVALS".into(), "PNG=writer-0".into()),
    ])?;
    config.validate()?;

    assert!(config.subscriber_id == "writer-0", "unexpected value parsed for SUBSCRIBER_ID, got {}, expected {}", config.subscriber_id, "writer-0");
    assert!(config.max_message_retries == 4, "unexpected value parsed for MAX_MESSAGE_RETRIES, got {}, expected {}", config.max_message_retries, 4);
    assert!(
        config.retry_backoff_base_ms == 250,
        "unexpected value parsed for RETRY_BACKOFF_BASE_MS, got {}, expected {}",
        config.retry_backoff_base_ms,
        250
    );
    assert!(!config.durable_subscriptions, "unexpected value parsed for DURABLE_SUBSCRIPTIONS, got {}, expected false", config.durable_subscriptions);
    assert!(!config.booking_enabled, "unexpected value parsed for BOOKING_ENABLED, got {}, expected false", config.booking_enabled);
    assert!(
        config.serve_evaluation.as_deref() == Some("ev1"),
        "unexpected value parsed for SERVE_EVALUATION, got {:?}, expected {:?}",
        config.serve_evaluation,
        Some("ev1")
    );
    assert!(config.writer_threads == 8, "unexpected value parsed for WRITER_THREADS, got {}, expected {}", config.writer_threads, 8);
    assert!(
        config.output_directory == Path::new("/var/lib/evaluations"),
        "unexpected value parsed for OUTPUT_DIRECTORY, got {}, expected {}",
        config.output_directory.display(),
        "/var/lib/evaluations"
    );
    assert!(config.liveness_interval_secs == 10, "unexpected value parsed for LIVENESS_INTERVAL_SECS, got {}", config.liveness_interval_secs);
    assert!(config.sweep_interval_secs == 30, "unexpected value parsed for SWEEP_INTERVAL_SECS, got {}", config.sweep_interval_secs);
    assert!(config.description_timeout_secs == 120, "unexpected value parsed for DESCRIPTION_TIMEOUT_SECS, got {}", config.description_timeout_secs);
    assert!(config.max_cause_levels == 3, "unexpected value parsed for MAX_CAUSE_LEVELS, got {}, expected {}", config.max_cause_levels, 3);
    assert!(
        config.format_approvals.as_deref() == Some("PNG=writer-0"),
        "unexpected value parsed for FORMAT_APPROVALS, got {:?}",
        config.format_approvals
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(Vec::<(String, String)>::new())?;
    config.validate()?;

    assert!(!config.subscriber_id.is_empty(), "expected a subscriber id to be generated");
    assert!(config.max_message_retries == 2, "unexpected default for MAX_MESSAGE_RETRIES, got {}, expected {}", config.max_message_retries, 2);
    assert!(
        config.retry_backoff_base_ms == 1000,
        "unexpected default for RETRY_BACKOFF_BASE_MS, got {}, expected {}",
        config.retry_backoff_base_ms,
        1000
    );
    assert!(config.durable_subscriptions, "expected durable subscriptions by default");
    assert!(config.booking_enabled, "expected booking to be enabled by default");
    assert!(config.serve_evaluation.is_none(), "expected no evaluation restriction by default, got {:?}", config.serve_evaluation);
    assert!(config.writer_threads == 4, "unexpected default for WRITER_THREADS, got {}, expected {}", config.writer_threads, 4);
    assert!(
        config.output_directory == std::env::temp_dir(),
        "unexpected default for OUTPUT_DIRECTORY, got {}",
        config.output_directory.display()
    );
    assert!(config.description_timeout_secs == 600, "unexpected default for DESCRIPTION_TIMEOUT_SECS, got {}", config.description_timeout_secs);
    assert!(config.max_cause_levels == 5, "unexpected default for MAX_CAUSE_LEVELS, got {}, expected {}", config.max_cause_levels, 5);

    Ok(())
}

#[test]
fn generated_subscriber_ids_differ() -> Result<()> {
    let (c0, c1): (Config, Config) = (envy::from_iter(Vec::<(String, String)>::new())?, envy::from_iter(Vec::<(String, String)>::new())?);
    assert_ne!(c0.subscriber_id, c1.subscriber_id, "expected distinct generated subscriber ids");
    Ok(())
}

#[test]
fn config_rejects_zero_writer_threads() -> Result<()> {
    let config: Config = envy::from_iter(vec![("WRITER_THREADS".into(), "0".into())])?;
    assert!(config.validate().is_err(), "expected validation to reject zero writer threads");
    Ok(())
}

#[test]
fn retry_backoff_doubles_per_attempt() -> Result<()> {
    let config: Config = envy::from_iter(vec![("RETRY_BACKOFF_BASE_MS".into(), "1000".into())])?;
    let delays: Vec<_> = (0..3).map(|attempt| config.retry_backoff(attempt).as_millis()).collect();
    assert_eq!(delays, vec![1000, 2000, 4000], "unexpected backoff progression {:?}", delays);
    Ok(())
}
