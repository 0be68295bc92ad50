//! AMQP queue client layer.
//!
//! Every component owns its own `ConnectionManager`, built from a shared
//! `ConnectionFactory`. Publishes can go straight out on the caller's
//! connection or through a `Worker` that serializes them on its own.

pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;

pub use message::{Delivery, DeliveryMode, Message};
pub use rabbitmq::{RabbitMQError, Result};
