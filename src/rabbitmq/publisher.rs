// src/rabbitmq/publisher.rs

use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, warn};

use super::amqp_client::PublishOutcome;
use super::connection::ConnectionManager;
use super::errors::Result;
use super::stats::{NoopStats, StatsRecorder};
use super::worker::{work_item, Worker};
use crate::message::Message;

/// Publishes `message` on the manager's confirm channel with the mandatory
/// flag set, and waits for the broker's confirmation.
///
/// An unroutable or nacked message is logged and reported in the returned
/// outcome. It is not retried and is not an error.
pub async fn send_message(
    manager: &mut ConnectionManager,
    exchange: &str,
    message: &Message,
) -> Result<PublishOutcome> {
    let channel = manager.confirm_channel().await?;
    let outcome = channel.publish(exchange, message, true).await?;

    match &outcome {
        PublishOutcome::Unroutable {
            reply_code,
            reply_text,
        } => warn!(
            exchange,
            routing_key = message.routing_key(),
            message_id = message.message_id().unwrap_or(""),
            reply_code,
            reply_text = %reply_text,
            "rabbitmq_message_unroutable"
        ),
        PublishOutcome::Nacked => warn!(
            exchange,
            routing_key = message.routing_key(),
            message_id = message.message_id().unwrap_or(""),
            "rabbitmq_message_nacked"
        ),
        _ => debug!(
            exchange,
            routing_key = message.routing_key(),
            bytes = message.body().len(),
            "rabbitmq_message_published"
        ),
    }
    Ok(outcome)
}

/// A message plus where and how to publish it.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub message: Message,
    /// Overrides the publisher's exchange.
    pub exchange: Option<String>,
    pub send_stats: bool,
}

impl PublishRequest {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            exchange: None,
            send_stats: true,
        }
    }

    pub fn to_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn without_stats(mut self) -> Self {
        self.send_stats = false;
        self
    }
}

impl From<Message> for PublishRequest {
    fn from(message: Message) -> Self {
        PublishRequest::new(message)
    }
}

/// Sends messages to the exchange, either directly on a caller's manager or
/// out of band through a `Worker`.
#[derive(Clone)]
pub struct Publisher {
    worker: Worker,
    exchange: String,
    stats: Arc<dyn StatsRecorder>,
}

impl Publisher {
    pub fn new(worker: Worker, exchange: impl Into<String>) -> Self {
        Self {
            worker,
            exchange: exchange.into(),
            stats: Arc::new(NoopStats),
        }
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsRecorder>) -> Self {
        self.stats = stats;
        self
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn stats(&self) -> &Arc<dyn StatsRecorder> {
        &self.stats
    }

    /// Publishes on the caller's own connection and returns the outcome.
    pub async fn publish(
        &self,
        manager: &mut ConnectionManager,
        request: impl Into<PublishRequest>,
    ) -> Result<PublishOutcome> {
        let request = request.into();
        let exchange = request.exchange.as_deref().unwrap_or(&self.exchange);
        let outcome = send_message(manager, exchange, &request.message).await?;
        if request.send_stats {
            self.stats
                .publish(exchange, request.message.routing_key(), &outcome);
        }
        Ok(outcome)
    }

    /// Queues the publish on the worker and returns once it is queued.
    ///
    /// The publish later runs on the worker's connection. Unroutable
    /// messages are only logged; transport failures go to the worker's
    /// error sink.
    pub async fn add_item(&self, request: impl Into<PublishRequest>) -> Result<()> {
        let request = request.into();
        let exchange = request
            .exchange
            .clone()
            .unwrap_or_else(|| self.exchange.clone());
        let stats = self.stats.clone();

        self.worker
            .submit(work_item(move |manager| {
                async move {
                    let outcome = send_message(manager, &exchange, &request.message).await?;
                    if request.send_stats {
                        stats.publish(&exchange, request.message.routing_key(), &outcome);
                    }
                    Ok(())
                }
                .boxed()
            }))
            .await
    }

    /// Serializes `value` as JSON and queues it like `add_item`.
    pub async fn add_kw<T: Serialize + ?Sized>(&self, routing_key: &str, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        let message = Message::new(routing_key, body)
            .with_generated_id()
            .with_header("content_type", "application/json");
        self.add_item(message).await
    }
}
