use std::collections::HashSet;

use rustrabbit::rabbitmq::memory::BrokerCall;
use rustrabbit::rabbitmq::{dedup_queue, DedupOptions, MemoryBroker};
use rustrabbit::DeliveryMode;

use crate::common::{declared, publisher};

#[tokio::test]
async fn test_eighty_messages_with_thirty_duplicates() {
    let broker = MemoryBroker::new();
    let factory = declared(&broker).await;
    // 50 distinct bodies, then 30 repeats of the first 30
    for i in 0..50 {
        broker.enqueue("scraper_q", format!("link_{}", i));
    }
    for i in 0..30 {
        broker.enqueue("scraper_q", format!("link_{}", i));
    }
    let publisher = publisher(&factory);
    let mut manager = factory.manager();

    let report = dedup_queue(
        &mut manager,
        &publisher,
        "scraper_q",
        DedupOptions {
            limit: 100,
            ..DedupOptions::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(report.scanned, 80);
    assert_eq!(report.unique, 50);
    assert_eq!(report.republished, 50);
    assert_eq!(broker.acked_count(), 80);
    assert_eq!(broker.unacked_count(), 0);
    let acks: Vec<_> = broker
        .journal()
        .into_iter()
        .filter(|call| matches!(call, BrokerCall::Ack { .. }))
        .collect();
    assert_eq!(acks, vec![BrokerCall::Ack { delivery_tag: 80, multiple: true }]);

    let remaining: HashSet<Vec<u8>> = broker.queue_bodies("scraper_q").into_iter().collect();
    assert_eq!(broker.queue_len("scraper_q"), 50);
    assert_eq!(remaining.len(), 50);
}

#[tokio::test]
async fn test_republish_to_other_routing_key_with_mode() {
    let broker = MemoryBroker::new();
    let factory = declared(&broker).await;
    for body in ["x", "y", "x"] {
        broker.enqueue("scraper_q", body);
    }
    let publisher = publisher(&factory);
    let mut manager = factory.manager();

    dedup_queue(
        &mut manager,
        &publisher,
        "scraper_q",
        DedupOptions {
            routing_key: Some("commentstree_q".to_string()),
            delivery_mode: DeliveryMode::Transient,
            ..DedupOptions::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(broker.queue_len("scraper_q"), 0);
    assert_eq!(
        broker.queue_bodies("commentstree_q"),
        vec![b"x".to_vec(), b"y".to_vec()]
    );
    let records = broker.publishes();
    assert!(records
        .iter()
        .all(|r| r.delivery_mode == DeliveryMode::Transient && r.message_id.is_none()));
}
