use std::path::Path;
use std::sync::Arc;

use rustrabbit::config::RabbitConfig;
use rustrabbit::rabbitmq::{
    ConnectionFactory, LogErrorSink, MemoryBroker, Publisher, Worker, WorkerConfig,
};

pub const FIXTURE: &str = "tests/fixtures/rabbitmq/configs/test_config.json";

pub fn load_test_config() -> RabbitConfig {
    RabbitConfig::load_from(Path::new(FIXTURE)).expect("Failed to load test config")
}

pub fn memory_factory(broker: &MemoryBroker) -> ConnectionFactory {
    let config = load_test_config();
    ConnectionFactory::new(
        broker.connector(),
        config.topology().expect("fixture topology is valid"),
    )
    .with_retry_delay(config.retry_delay())
}

pub fn publisher(factory: &ConnectionFactory) -> Publisher {
    let config = load_test_config();
    let worker = Worker::spawn(factory.manager(), WorkerConfig::default(), Arc::new(LogErrorSink));
    Publisher::new(worker, config.exchange.name)
}

/// Connects once so the fixture queues exist before messages are seeded.
pub async fn declared(broker: &MemoryBroker) -> ConnectionFactory {
    let factory = memory_factory(broker);
    let mut manager = factory.manager();
    manager.get_connection().await.expect("memory broker connects");
    factory
}
