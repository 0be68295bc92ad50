use std::time::Duration;

use rustrabbit::rabbitmq::memory::BrokerCall;
use rustrabbit::rabbitmq::{
    BatchConsumer, BatchOptions, BatchStep, Channel, HandlerError, MemoryBroker, RabbitMQError,
    StopReason,
};
use rustrabbit::Delivery;

use crate::common::{declared, memory_factory};

fn ok() -> Result<(), HandlerError> {
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_partial_batch_once_min_size_is_met() {
    let broker = MemoryBroker::new();
    let factory = declared(&broker).await;
    for i in 0..3 {
        broker.enqueue("scraper_q", format!("m{}", i));
    }
    let mut consumer = BatchConsumer::new(factory.manager());
    let mut sizes = Vec::new();

    let options = BatchOptions {
        limit: 5,
        min_size: 2,
        ..BatchOptions::default()
    };
    let started = tokio::time::Instant::now();
    let step = consumer
        .handle_batch("scraper_q", &options, &mut |items: Vec<Delivery>, _channel: Channel| {
            sizes.push(items.len());
            async { ok() }
        })
        .await
        .unwrap();

    assert_eq!(step, BatchStep::Processed(3));
    assert_eq!(sizes, vec![3]);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(broker.acked_count(), 3);
    assert!(broker
        .journal()
        .contains(&BrokerCall::Ack { delivery_tag: 3, multiple: true }));
}

#[tokio::test]
async fn test_failing_callback_requeues_whole_batch_and_propagates() {
    let broker = MemoryBroker::new();
    let factory = declared(&broker).await;
    for i in 0..4 {
        broker.enqueue("scraper_q", format!("m{}", i));
    }
    let mut consumer = BatchConsumer::new(factory.manager());

    let result = consumer
        .handle_items(
            "scraper_q",
            BatchOptions {
                limit: 4,
                drain: true,
                ..BatchOptions::default()
            },
            |_, _| async { Err::<(), HandlerError>("index unavailable".into()) },
        )
        .await;

    match result {
        Err(RabbitMQError::HandlerError(e)) => assert_eq!(e.to_string(), "index unavailable"),
        other => panic!("expected handler error, got {:?}", other),
    }
    let rejects: Vec<_> = broker
        .journal()
        .into_iter()
        .filter(|call| matches!(call, BrokerCall::Reject { requeue: true, .. }))
        .collect();
    assert_eq!(rejects.len(), 4);
    assert_eq!(broker.acked_count(), 0);
    assert_eq!(broker.queue_len("scraper_q"), 4);
}

#[tokio::test]
async fn test_min_size_above_limit_fails_before_connecting() {
    let broker = MemoryBroker::new();
    let mut consumer = BatchConsumer::new(memory_factory(&broker).manager());

    let result = consumer
        .handle_items(
            "scraper_q",
            BatchOptions {
                limit: 2,
                min_size: 5,
                ..BatchOptions::default()
            },
            |_, _| async { ok() },
        )
        .await;

    assert!(matches!(result, Err(RabbitMQError::ValidationError(_))));
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test]
async fn test_each_batch_is_all_or_nothing() {
    let broker = MemoryBroker::new();
    let factory = declared(&broker).await;
    for i in 0..9 {
        broker.enqueue("scraper_q", format!("m{}", i));
    }
    let mut consumer = BatchConsumer::new(factory.manager());
    let options = BatchOptions {
        limit: 3,
        drain: true,
        ..BatchOptions::default()
    };

    let mut batch = 0;
    let mut callback = |items: Vec<Delivery>, _channel: Channel| {
        batch += 1;
        let fail = batch == 2;
        assert_eq!(items.len(), 3);
        async move {
            if fail {
                Err::<(), HandlerError>("second batch fails".into())
            } else {
                Ok(())
            }
        }
    };

    let acked_before = broker.acked_count();
    consumer.handle_batch("scraper_q", &options, &mut callback).await.unwrap();
    assert_eq!(broker.acked_count() - acked_before, 3);
    assert_eq!(broker.rejected_count(), 0);

    let acked_before = broker.acked_count();
    assert!(consumer
        .handle_batch("scraper_q", &options, &mut callback)
        .await
        .is_err());
    assert_eq!(broker.acked_count(), acked_before);
    assert_eq!(broker.rejected_count(), 3);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_len("scraper_q"), 6);
}

#[tokio::test(start_paused = true)]
async fn test_waiting_loop_stops_on_cancel() {
    let broker = MemoryBroker::new();
    let factory = declared(&broker).await;
    let mut consumer = BatchConsumer::new(factory.manager());
    let token = consumer.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        token.cancel();
    });

    let summary = consumer
        .handle_items("scraper_q", BatchOptions::default(), |_, _| async { ok() })
        .await
        .unwrap();

    assert_eq!(summary.stopped, StopReason::Cancelled);
    assert_eq!(summary.batches, 0);
}
