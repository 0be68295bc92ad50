// src/rabbitmq/mod.rs
// Broker-facing side of the crate: connections, publishing, consuming

pub mod admin;
pub mod amqp_client;
pub mod batch_processor;
pub mod connection;
pub mod consumer;
pub mod dedup;
pub mod errors;
pub mod lapin_client;
pub mod memory;
pub mod publisher;
pub mod stats;
pub mod topology;
pub mod worker;

// Re-export the pieces most callers need
pub use admin::empty_queue;
pub use amqp_client::{Channel, Connector, PublishOutcome};
pub use batch_processor::{BatchConsumer, BatchOptions, BatchStep, HandleSummary};
pub use connection::{ConnectionFactory, ConnectionManager};
pub use consumer::{ConsumeOptions, ConsumeSummary, Disposition, StopReason, StreamConsumer};
pub use dedup::{dedup_queue, DedupOptions, DedupReport};
pub use errors::{HandlerError, RabbitMQError, Result};
pub use lapin_client::LapinConnector;
pub use memory::MemoryBroker;
pub use publisher::{send_message, PublishRequest, Publisher};
pub use stats::{BatchOutcome, NoopStats, StatsRecorder, TracingStats};
pub use topology::{QueueDefinition, Topology, TopologyBuilder};
pub use worker::{ErrorSink, FullPolicy, LogErrorSink, Worker, WorkerConfig};
