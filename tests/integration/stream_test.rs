use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustrabbit::rabbitmq::memory::BrokerCall;
use rustrabbit::rabbitmq::{
    Disposition, HandlerError, MemoryBroker, StatsRecorder, StopReason, StreamConsumer,
};
use tokio::sync::mpsc;

use crate::common::{declared, load_test_config};

#[derive(Default)]
struct DeliveryCounts {
    acked: AtomicUsize,
    requeued: AtomicUsize,
}

impl StatsRecorder for DeliveryCounts {
    fn delivery(&self, _queue: &str, acked: bool) {
        if acked {
            self.acked.fetch_add(1, Ordering::SeqCst);
        } else {
            self.requeued.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn test_ack_only_when_callback_accepts() {
    let broker = MemoryBroker::new();
    let factory = declared(&broker).await;
    for body in ["message_0004", "message_0005", "message_0006"] {
        broker.enqueue("vote_link_q", body);
    }
    let stats = Arc::new(DeliveryCounts::default());
    let mut consumer = StreamConsumer::new(factory.manager())
        .with_options(load_test_config().consume_options())
        .with_stats(stats.clone());
    let token = consumer.cancellation_token();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        consumer
            .consume_items("vote_link_q", move |delivery| {
                let seen_tx = seen_tx.clone();
                async move {
                    let body = delivery.body_str().into_owned();
                    let _ = seen_tx.send((body.clone(), delivery.redelivered));
                    // reject the first delivery of message_0005 only
                    if body == "message_0005" && !delivery.redelivered {
                        Ok::<_, HandlerError>(Disposition::Requeue)
                    } else {
                        Ok(Disposition::Ack)
                    }
                }
            })
            .await
    });

    let mut seen = Vec::new();
    while seen.len() < 4 {
        seen.push(seen_rx.recv().await.unwrap());
    }
    while broker.acked_count() < 3 {
        tokio::task::yield_now().await;
    }
    token.cancel();
    let summary = handle.await.unwrap().unwrap();

    assert_eq!(
        seen,
        vec![
            ("message_0004".to_string(), false),
            ("message_0005".to_string(), false),
            ("message_0005".to_string(), true),
            ("message_0006".to_string(), false),
        ]
    );
    assert_eq!(summary.acked, 3);
    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.stopped, StopReason::Cancelled);
    assert_eq!(broker.requeued_count(), 1);
    assert_eq!(broker.queue_len("vote_link_q"), 0);
    assert_eq!(stats.acked.load(Ordering::SeqCst), 3);
    assert_eq!(stats.requeued.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_prefetch_window_and_cancel() {
    let broker = MemoryBroker::new();
    let factory = declared(&broker).await;
    let mut consumer = StreamConsumer::new(factory.manager())
        .with_options(load_test_config().consume_options());
    let token = consumer.cancellation_token();

    let handle = tokio::spawn(async move {
        consumer
            .consume_items("commentstree_q", |_| async { Ok::<_, HandlerError>(Disposition::Ack) })
            .await
    });
    while !broker
        .journal()
        .iter()
        .any(|call| matches!(call, BrokerCall::Consume { .. }))
    {
        tokio::task::yield_now().await;
    }
    broker.enqueue("commentstree_q", "late arrival");
    while broker.acked_count() < 1 {
        tokio::task::yield_now().await;
    }
    token.cancel();
    let summary = handle.await.unwrap().unwrap();

    assert_eq!(summary.acked, 1);
    let journal = broker.journal();
    assert!(journal.contains(&BrokerCall::Qos { prefetch_count: 1000 }));
    assert!(journal.iter().any(|call| matches!(
        call,
        BrokerCall::Cancel { consumer_tag } if consumer_tag.starts_with("it-")
    )));
}
