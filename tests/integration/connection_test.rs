use std::time::Duration;

use rustrabbit::rabbitmq::memory::BrokerCall;
use rustrabbit::rabbitmq::{LapinConnector, MemoryBroker, Connector};

use crate::common::{load_test_config, memory_factory};

#[test]
fn test_fixture_config_builds_topology() {
    let config = load_test_config();
    let topology = config.topology().unwrap();

    assert_eq!(topology.exchange().name, "rustrabbit_test");
    assert_eq!(topology.queues().count(), 4);
    // four self bindings plus one extra routing key
    assert_eq!(topology.binding_count(), 5);
    assert_eq!(config.retry_delay(), Duration::from_millis(50));
}

#[tokio::test]
async fn test_each_manager_gets_its_own_connection() {
    let broker = MemoryBroker::new();
    let factory = memory_factory(&broker);
    let mut first = factory.manager();
    let mut second = factory.manager();

    first.get_channel(false).await.unwrap();
    second.get_channel(false).await.unwrap();

    assert_eq!(broker.connections_opened(), 2);
    // declarations are idempotent, so both connections declare
    let exchange_declares = broker
        .journal()
        .iter()
        .filter(|call| matches!(call, BrokerCall::DeclareExchange { .. }))
        .count();
    assert_eq!(exchange_declares, 2);
    assert!(broker.has_binding("rustrabbit_test", "vote_link_alt", "vote_link_q"));
    assert!(broker.has_queue("newcomments_q"));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_broker_blocks_until_it_returns() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(10);
    let mut manager = memory_factory(&broker).manager();

    let started = tokio::time::Instant::now();
    manager.get_channel(false).await.unwrap();

    assert_eq!(broker.connect_attempts(), 11);
    assert_eq!(started.elapsed(), Duration::from_millis(500));
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance at AMQP_ADDR
async fn test_connection_establishes() {
    let uri = std::env::var("AMQP_ADDR").unwrap_or_else(|_| load_test_config().connection.uri);
    let connector = LapinConnector::new(&uri).with_heartbeat(30);

    let connection = connector.connect().await.unwrap();
    assert!(connection.is_connected());
    let channel = connection.create_channel().await.unwrap();
    assert!(channel.is_open());
    connection.close().await.unwrap();
}
