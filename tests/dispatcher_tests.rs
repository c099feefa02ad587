use std::{sync::Arc, time::Duration};

use anyhow::Result;
use dispatch_service::{
    clients::{broker::Broker, memory::InMemoryBroker},
    error::{DispatchError, ErrorKind},
    models::message::{DlqMessage, Priority},
};
use tokio_test::assert_ok;

use crate::common::{FlakyBroker, Harness, RecordingDeliverer, eventually, notification};

const WAIT: Duration = Duration::from_secs(5);

/// Test: A delivered message is acknowledged and leaves no trace in the queues
#[tokio::test]
async fn test_successful_delivery_acknowledged() -> Result<()> {
    let harness = Harness::new(RecordingDeliverer::default(), 2).await;
    harness.dispatcher.start().await?;

    let message = notification("user-1", "Welcome");
    harness.dispatcher.enqueue_notification(&message).await?;

    let deliverer = harness.deliverer.clone();
    assert!(
        eventually(WAIT, || {
            let deliverer = deliverer.clone();
            async move { deliverer.delivered().len() == 1 }
        })
        .await
    );
    assert_eq!(harness.deliverer.delivered(), vec![message.id.clone()]);

    let broker = harness.broker.clone();
    assert!(
        eventually(WAIT, || {
            let broker = broker.clone();
            async move { broker.unacked_count().await == 0 }
        })
        .await
    );

    let topology = harness.dispatcher.topology().clone();
    assert!(harness.queued_messages(&topology.main).await.is_empty());
    assert!(harness.queued_messages(&topology.retry).await.is_empty());
    assert!(harness.queued_messages(&topology.dead_letter).await.is_empty());

    let monitor = harness.dispatcher.monitor().clone();
    assert!(
        eventually(WAIT, || {
            let monitor = monitor.clone();
            let main = topology.main.clone();
            async move {
                monitor
                    .get_queue_metrics(&main)
                    .is_ok_and(|m| m.total_processed == 1)
            }
        })
        .await
    );
    assert_eq!(monitor.get_queue_metrics(&topology.main)?.total_failed, 0);

    harness.dispatcher.shutdown().await;
    Ok(())
}

/// Test: A message that never delivers is retried, then dead-lettered
#[tokio::test]
async fn test_failing_message_dead_lettered_after_retries() -> Result<()> {
    let harness = Harness::new(RecordingDeliverer::failing(), 1).await;
    harness.dispatcher.start().await?;

    let message = notification("user-1", "Statement ready").with_max_retries(2);
    harness.dispatcher.enqueue_notification(&message).await?;

    let topology = harness.dispatcher.topology().clone();
    let broker = harness.broker.clone();
    let dead_letter = topology.dead_letter.clone();
    assert!(
        eventually(WAIT, || {
            let broker = broker.clone();
            let dead_letter = dead_letter.clone();
            async move { broker.queued_payloads(&dead_letter).await.len() == 1 }
        })
        .await
    );

    let payloads = harness.broker.queued_payloads(&topology.dead_letter).await;
    let dlq: DlqMessage = serde_json::from_slice(&payloads[0])?;
    assert_eq!(dlq.message.id, message.id);
    assert_eq!(dlq.message.retry_count, 3);
    assert!(dlq.error.contains("provider rejected"));

    // One first attempt plus max_retries retries.
    assert_eq!(harness.deliverer.attempts(), 3);
    assert!(harness.queued_messages(&topology.main).await.is_empty());
    assert!(harness.queued_messages(&topology.retry).await.is_empty());

    let monitor = harness.dispatcher.monitor().clone();
    let retry = topology.retry.clone();
    assert!(
        eventually(WAIT, || {
            let monitor = monitor.clone();
            let retry = retry.clone();
            async move {
                monitor
                    .get_queue_metrics(&retry)
                    .is_ok_and(|m| m.total_failed == 2)
            }
        })
        .await
    );
    assert_eq!(monitor.get_queue_metrics(&topology.main)?.total_failed, 1);

    harness.dispatcher.shutdown().await;
    Ok(())
}

/// Test: A message with no retry budget goes straight to the dead-letter queue
#[tokio::test]
async fn test_zero_retry_budget_dead_letters_immediately() -> Result<()> {
    let harness = Harness::new(RecordingDeliverer::failing(), 1).await;
    harness.dispatcher.start().await?;

    let message = notification("user-1", "One shot").with_max_retries(0);
    harness.dispatcher.enqueue_notification(&message).await?;

    let broker = harness.broker.clone();
    let dead_letter = harness.dispatcher.topology().dead_letter.clone();
    assert!(
        eventually(WAIT, || {
            let broker = broker.clone();
            let dead_letter = dead_letter.clone();
            async move { broker.queued_payloads(&dead_letter).await.len() == 1 }
        })
        .await
    );
    assert_eq!(harness.deliverer.attempts(), 1);

    harness.dispatcher.shutdown().await;
    Ok(())
}

/// Test: Publish failures surface to the caller
#[tokio::test]
async fn test_enqueue_failure_propagates() {
    let broker = InMemoryBroker::new();
    let flaky = Arc::new(FlakyBroker::new(broker.clone(), "\"title\":\"Rejected\""));
    let harness = Harness::with_broker(broker, flaky, RecordingDeliverer::default(), 1).await;

    let err = harness
        .dispatcher
        .enqueue_notification(&notification("user-1", "Rejected"))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Broker(_)));
    assert_eq!(err.kind(), ErrorKind::Infrastructure);

    assert_ok!(
        harness
            .dispatcher
            .enqueue_notification(&notification("user-1", "Accepted"))
            .await
    );
}

/// Test: Enqueue maps tiers onto broker priorities
#[tokio::test]
async fn test_enqueue_preserves_priority() -> Result<()> {
    let harness = Harness::new(RecordingDeliverer::default(), 1).await;

    harness
        .dispatcher
        .enqueue_notification(&notification("user-1", "Later").with_priority(Priority::Low))
        .await?;
    harness
        .dispatcher
        .enqueue_notification(&notification("user-2", "Now").with_priority(Priority::Urgent))
        .await?;

    let main = harness.dispatcher.topology().main.clone();
    let titles: Vec<String> = harness
        .queued_messages(&main)
        .await
        .into_iter()
        .map(|m| m.title)
        .collect();
    assert_eq!(titles, vec!["Now", "Later"]);

    Ok(())
}

/// Test: Pool status reports workers and queue depths
#[tokio::test]
async fn test_worker_pool_status() -> Result<()> {
    let harness = Harness::new(RecordingDeliverer::default(), 3).await;

    let before = harness.dispatcher.get_worker_pool_status().await?;
    assert_eq!(before.total_workers, 0);

    harness.dispatcher.start().await?;
    // Starting twice does not spawn a second pool.
    harness.dispatcher.start().await?;

    let status = harness.dispatcher.get_worker_pool_status().await?;
    assert_eq!(status.total_workers, 3);
    assert_eq!(status.active_workers + status.idle_workers, 3);
    assert_eq!(status.queue_lengths.len(), 3);
    assert_eq!(status.processing_rates.len(), 3);

    let topology = harness.dispatcher.topology().clone();
    let depth = harness.broker.queue_depth(&topology.main).await?;
    assert_eq!(depth.consumer_count, 3);

    harness.dispatcher.shutdown().await;
    Ok(())
}

/// Test: Snapshots capture queue depth and can be read back
#[tokio::test]
async fn test_snapshot_round_trip_through_store() -> Result<()> {
    let harness = Harness::new(RecordingDeliverer::default(), 1).await;
    assert!(harness.dispatcher.last_snapshot().await?.is_none());

    harness
        .dispatcher
        .enqueue_notification(&notification("user-1", "A"))
        .await?;
    harness
        .dispatcher
        .enqueue_notification(&notification("user-2", "B"))
        .await?;

    let written = harness.dispatcher.write_snapshot().await?;
    let main = harness.dispatcher.topology().main.clone();
    assert_eq!(written.queues[&main].message_count, 2);
    assert!(harness.store.lookup("dispatcher:state").is_some());

    let read = harness.dispatcher.last_snapshot().await?;
    assert_eq!(read, Some(written));

    // The snapshot also feeds observed depth into the monitor.
    let metrics = harness.dispatcher.monitor().get_queue_metrics(&main)?;
    assert_eq!(metrics.queue_length, 2);

    Ok(())
}

/// Test: After shutdown nothing is consumed and channels are released
#[tokio::test]
async fn test_shutdown_stops_consumers() -> Result<()> {
    let harness = Harness::new(RecordingDeliverer::default(), 2).await;
    harness.dispatcher.start().await?;
    harness.dispatcher.shutdown().await;

    let topology = harness.dispatcher.topology().clone();
    assert_eq!(harness.broker.queue_depth(&topology.main).await?.consumer_count, 0);
    assert!(harness.dispatcher.last_snapshot().await?.is_some());

    harness
        .dispatcher
        .enqueue_notification(&notification("user-1", "After shutdown"))
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(harness.deliverer.delivered().is_empty());
    assert_eq!(harness.queued_messages(&topology.main).await.len(), 1);

    Ok(())
}
