//! `lapin`-backed implementation of the broker traits.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info, warn};

use super::amqp_client::{
    redact_uri, BrokerChannel, BrokerConnection, Channel, Connector, DeliveryStream,
    PublishOutcome,
};
use super::errors::{RabbitMQError, Result};
use super::topology::{ExchangeDefinition, QueueDefinition};
use crate::message::{Delivery, DeliveryMode, Headers, Message};

/// Connects to a real broker with `lapin`.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    uri: String,
}

impl LapinConnector {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
        }
    }

    /// Adds a `heartbeat` query parameter unless the URI already has one.
    pub fn with_heartbeat(mut self, heartbeat_seconds: u16) -> Self {
        if heartbeat_seconds > 0 && !self.uri.contains("heartbeat=") {
            let separator = if self.uri.contains('?') { '&' } else { '?' };
            self.uri = format!("{}{}heartbeat={}", self.uri, separator, heartbeat_seconds);
        }
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        info!(broker = %self.describe(), "rabbitmq_connecting");
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))?;
        info!("rabbitmq_connected");
        Ok(Arc::new(LapinConnection { connection }))
    }

    fn describe(&self) -> String {
        redact_uri(&self.uri)
    }
}

pub struct LapinConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Channel> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;
        debug!(channel_id = channel.id(), "rabbitmq_channel_created");
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.is_connected() {
            self.connection.close(200, "Normal shutdown").await?;
        }
        Ok(())
    }
}

pub struct LapinChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, exchange: &ExchangeDefinition) -> Result<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::DeclareError(format!(
                    "Failed to declare exchange '{}': {}",
                    exchange.name, e
                ))
            })
    }

    async fn declare_queue(&self, name: &str, definition: &QueueDefinition) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: definition.durable,
                    exclusive: definition.exclusive,
                    auto_delete: definition.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| {
                RabbitMQError::DeclareError(format!("Failed to declare queue '{}': {}", name, e))
            })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RabbitMQError::DeclareError(format!(
                    "Failed to bind queue '{}' to '{}' with '{}': {}",
                    queue, exchange, routing_key, e
                ))
            })
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e))
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        message: &Message,
        mandatory: bool,
    ) -> Result<PublishOutcome> {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(message.delivery_mode().as_u8())
            .with_timestamp(message.timestamp().timestamp() as u64);
        if let Some(message_id) = message.message_id() {
            properties = properties.with_message_id(message_id.to_string().into());
        }
        if let Some(headers) = message.headers() {
            properties = properties.with_headers(to_field_table(headers));
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                message.routing_key(),
                BasicPublishOptions {
                    mandatory,
                    ..BasicPublishOptions::default()
                },
                message.body(),
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| RabbitMQError::PublishError(format!("Failed to confirm publish: {}", e)))?;

        Ok(match confirmation {
            Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
                PublishOutcome::Unroutable {
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.as_str().to_string(),
                }
            }
            Confirmation::Ack(None) => PublishOutcome::Confirmed,
            Confirmation::Nack(None) => PublishOutcome::Nacked,
            Confirmation::NotRequested => PublishOutcome::Unconfirmed,
        })
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;
        Ok(message.map(|m| convert_delivery(m.delivery)))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(convert_delivery)
                    .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
    }

    async fn purge(&self, queue: &str) -> Result<u32> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to purge '{}': {}", queue, e)))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}

fn convert_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let message_id = properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    let delivery_mode = (*properties.delivery_mode()).and_then(DeliveryMode::from_u8);
    let headers = properties.headers().as_ref().map(from_field_table);

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        body: delivery.data,
        message_id,
        delivery_mode,
        headers,
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
    }
    table
}

fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                other => {
                    warn!(header = key.as_str(), "rabbitmq_header_not_a_string");
                    format!("{:?}", other)
                }
            };
            (key.as_str().to_string(), value)
        })
        .collect()
}
