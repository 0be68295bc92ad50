// src/rabbitmq/amqp_client.rs

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::Result;
use super::topology::{ExchangeDefinition, QueueDefinition};
use crate::message::{Delivery, Message};

/// Shared handle to an open channel.
pub type Channel = Arc<dyn BrokerChannel>;

/// Deliveries pushed by the broker to a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// What the broker said about a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Routed and confirmed by the broker.
    Confirmed,
    /// Confirm mode was not enabled on the channel, so nothing is known.
    Unconfirmed,
    /// The broker refused the message.
    Nacked,
    /// No queue matched the routing key; the broker returned the message.
    Unroutable { reply_code: u16, reply_text: String },
}

impl PublishOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PublishOutcome::Confirmed | PublishOutcome::Unconfirmed)
    }
}

/// Opens connections to a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;

    /// Broker address for logs, without credentials.
    fn describe(&self) -> String;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Channel>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// The broker operations the queue components are written against.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, exchange: &ExchangeDefinition) -> Result<()>;

    async fn declare_queue(&self, name: &str, definition: &QueueDefinition) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Puts the channel in publisher-confirm mode.
    async fn enable_confirms(&self) -> Result<()>;

    /// Publishes and, in confirm mode, waits for the broker's verdict.
    async fn publish(
        &self,
        exchange: &str,
        message: &Message,
        mandatory: bool,
    ) -> Result<PublishOutcome>;

    /// Non-blocking single fetch. `None` when the queue is empty.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>>;

    /// Acknowledges `delivery_tag`, or every outstanding tag up to it when
    /// `multiple` is set.
    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Drops every ready message in the queue, returning how many.
    async fn purge(&self, queue: &str) -> Result<u32>;

    fn is_open(&self) -> bool;
}

/// Strips the userinfo part from an AMQP URI.
pub fn redact_uri(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &uri[..scheme_end], &uri[at + 1..])
        }
        _ => uri.to_string(),
    }
}
