use std::collections::HashSet;

use rustrabbit::rabbitmq::{MemoryBroker, PublishOutcome};
use rustrabbit::{DeliveryMode, Message};

use crate::common::{memory_factory, publisher};

#[tokio::test]
async fn test_ten_publishes_are_mandatory_confirmed_and_unique() {
    let broker = MemoryBroker::new();
    let factory = memory_factory(&broker);
    let publisher = publisher(&factory);

    for i in 0..10 {
        let message = Message::new("scraper_q", format!("link_{:04}", i)).with_generated_id();
        publisher.add_item(message).await.unwrap();
    }
    publisher.worker().join().await.unwrap();

    let records = broker.publishes();
    assert_eq!(records.len(), 10);
    assert!(records.iter().all(|r| r.mandatory && r.confirm_mode));
    assert!(records.iter().all(|r| r.delivery_mode == DeliveryMode::Durable));
    let ids: HashSet<_> = records.iter().filter_map(|r| r.message_id.clone()).collect();
    assert_eq!(ids.len(), 10);
    assert_eq!(broker.queue_len("scraper_q"), 10);
}

#[tokio::test]
async fn test_worker_publishes_in_submission_order() {
    let broker = MemoryBroker::new();
    let factory = memory_factory(&broker);
    let publisher = publisher(&factory);

    for i in 0..50 {
        publisher
            .add_item(Message::new("commentstree_q", i.to_string()))
            .await
            .unwrap();
    }
    publisher.worker().join().await.unwrap();

    let bodies: Vec<String> = broker
        .queue_bodies("commentstree_q")
        .into_iter()
        .map(|b| String::from_utf8(b).unwrap())
        .collect();
    let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
    assert_eq!(bodies, expected);
    // every publish went over the worker's single channel
    let channels: HashSet<_> = broker.publishes().iter().map(|r| r.channel_id).collect();
    assert_eq!(channels.len(), 1);
}

#[tokio::test]
async fn test_unroutable_publish_is_dropped_not_raised() {
    let broker = MemoryBroker::new();
    let factory = memory_factory(&broker);
    let publisher = publisher(&factory);
    let mut manager = factory.manager();

    let outcome = publisher
        .publish(&mut manager, Message::new("no_such_key", "lost"))
        .await
        .unwrap();
    assert!(matches!(outcome, PublishOutcome::Unroutable { .. }));

    publisher
        .add_item(Message::new("no_such_key", "lost again"))
        .await
        .unwrap();
    publisher
        .add_item(Message::new("scraper_q", "kept"))
        .await
        .unwrap();
    publisher.worker().join().await.unwrap();

    assert_eq!(broker.queue_bodies("scraper_q"), vec![b"kept".to_vec()]);
    assert!(publisher.worker().is_running());
}

#[tokio::test]
async fn test_transient_delivery_mode_is_carried() {
    let broker = MemoryBroker::new();
    let factory = memory_factory(&broker);
    let publisher = publisher(&factory);
    let mut manager = factory.manager();

    publisher
        .publish(
            &mut manager,
            Message::new("newcomments_q", "fresh").with_delivery_mode(DeliveryMode::Transient),
        )
        .await
        .unwrap();

    assert_eq!(broker.publishes()[0].delivery_mode, DeliveryMode::Transient);
}
