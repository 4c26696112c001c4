use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;

use crate::broker::{Broker, DeliveryResponse, MemoryBroker, MessageMetadata, SubscriptionSetup, Topic};

const TIMEOUT: Duration = Duration::from_secs(5);

fn setup(topic: Topic, name: &str) -> SubscriptionSetup {
    SubscriptionSetup {
        topic,
        name: name.into(),
        durable: false,
    }
}

#[tokio::test]
async fn published_messages_reach_every_subscription_in_order() -> Result<()> {
    let broker = MemoryBroker::default();
    let mut sub_a = broker.subscribe(setup(Topic::Statistics, "a")).await?;
    let mut sub_b = broker.subscribe(setup(Topic::Statistics, "b")).await?;
    let publisher = broker.publisher(Topic::Statistics)?;

    for idx in 0..3 {
        publisher.publish(MessageMetadata::new(format!("m{}", idx), "ev1"), Bytes::from(vec![idx])).await?;
    }

    for sub in [&mut sub_a, &mut sub_b] {
        for idx in 0..3u8 {
            let delivery = tokio::time::timeout(TIMEOUT, sub.recv()).await?.context("subscription closed")?;
            let expected = format!("m{}", idx);
            assert_eq!(
                delivery.metadata.message_id.as_deref(),
                Some(expected.as_str()),
                "expected message {}, got {:?}",
                expected,
                delivery.metadata.message_id
            );
            assert_eq!(delivery.body.as_ref(), &[idx], "unexpected body {:?}", delivery.body);
            let _ = delivery.response.send(DeliveryResponse::Ack);
        }
    }
    Ok(())
}

#[tokio::test]
async fn recovered_messages_are_redelivered_then_dead_lettered() -> Result<()> {
    let broker = MemoryBroker::new(2);
    let mut sub = broker.subscribe(setup(Topic::Status, "status")).await?;
    let publisher = broker.publisher(Topic::Status)?;
    publisher.publish(MessageMetadata::new("m0", "ev1"), Bytes::new()).await?;
    publisher.publish(MessageMetadata::new("m1", "ev1"), Bytes::new()).await?;

    // The first delivery plus two redeliveries, the last response being a dropped sender.
    for attempt in 0..3 {
        let delivery = tokio::time::timeout(TIMEOUT, sub.recv()).await?.context("subscription closed")?;
        assert_eq!(delivery.metadata.message_id.as_deref(), Some("m0"), "expected redelivery of m0 on attempt {}", attempt);
        if attempt < 2 {
            let _ = delivery.response.send(DeliveryResponse::Recover);
        }
    }

    let next = tokio::time::timeout(TIMEOUT, sub.recv()).await?.context("subscription closed")?;
    assert_eq!(next.metadata.message_id.as_deref(), Some("m1"), "expected m1 after m0 was dead-lettered, got {:?}", next.metadata.message_id);
    let _ = next.response.send(DeliveryResponse::Ack);

    let dead = broker.dead_letters().await;
    assert_eq!(dead.len(), 1, "expected one dead letter, got {}", dead.len());
    assert_eq!(dead[0].1.message_id.as_deref(), Some("m0"), "unexpected dead letter {:?}", dead[0].1);
    Ok(())
}

#[tokio::test]
async fn unsubscribed_and_duplicate_subscriptions() -> Result<()> {
    let broker = MemoryBroker::default();
    let _sub = broker.subscribe(setup(Topic::Evaluation, "ev")).await?;
    assert!(
        broker.subscribe(setup(Topic::Evaluation, "ev")).await.is_err(),
        "expected a duplicate subscription name to be rejected"
    );
    assert_eq!(broker.subscriptions(Topic::Evaluation).await, vec!["ev".to_string()], "expected one live subscription");

    broker.unsubscribe(Topic::Evaluation, "ev").await?;
    assert!(broker.subscriptions(Topic::Evaluation).await.is_empty(), "expected no subscriptions after unsubscribe");
    Ok(())
}
