// src/rabbitmq/consumer.rs

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::ConnectionManager;
use super::errors::{HandlerError, Result};
use super::stats::{NoopStats, StatsRecorder};
use crate::message::Delivery;

pub const DEFAULT_PREFETCH_COUNT: u16 = 1000;

/// What to do with a delivery once the callback has seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Reject and put the message back on the queue for redelivery.
    Requeue,
}

/// Why a consume or batch loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The queue was empty and the caller asked to stop at that point.
    Drained,
    Cancelled,
    /// The broker ended the delivery stream.
    StreamClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub prefetch_count: u16,
    pub consumer_tag_prefix: String,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            consumer_tag_prefix: "rustrabbit".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub acked: u64,
    pub requeued: u64,
    pub stopped: StopReason,
}

/// Push consumer that settles every delivery individually.
pub struct StreamConsumer {
    manager: ConnectionManager,
    options: ConsumeOptions,
    cancel: CancellationToken,
    stats: Arc<dyn StatsRecorder>,
}

impl StreamConsumer {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            options: ConsumeOptions::default(),
            cancel: CancellationToken::new(),
            stats: Arc::new(NoopStats),
        }
    }

    pub fn with_options(mut self, options: ConsumeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsRecorder>) -> Self {
        self.stats = stats;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Consumes `queue` until cancelled, calling `callback` once per
    /// delivery in order.
    ///
    /// The message is acknowledged when the callback returns
    /// `Disposition::Ack`, and rejected with requeue when it returns
    /// `Disposition::Requeue` or an error.
    pub async fn consume_items<F, Fut>(&mut self, queue: &str, mut callback: F) -> Result<ConsumeSummary>
    where
        F: FnMut(Delivery) -> Fut,
        Fut: Future<Output = std::result::Result<Disposition, HandlerError>>,
    {
        let channel = self.manager.get_channel(false).await?;
        channel.set_prefetch(self.options.prefetch_count).await?;

        let consumer_tag = format!("{}-{}", self.options.consumer_tag_prefix, Uuid::new_v4());
        let mut deliveries = channel.consume(queue, &consumer_tag).await?;
        info!(
            queue,
            consumer_tag = %consumer_tag,
            prefetch_count = self.options.prefetch_count,
            "rabbitmq_consumer_started"
        );

        let mut summary = ConsumeSummary {
            acked: 0,
            requeued: 0,
            stopped: StopReason::StreamClosed,
        };
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    summary.stopped = StopReason::Cancelled;
                    if let Err(e) = channel.cancel(&consumer_tag).await {
                        warn!(queue, consumer_tag = %consumer_tag, error = %e, "rabbitmq_consumer_cancel_failed");
                    }
                    break;
                }
                next = deliveries.next() => next,
            };
            let delivery = match next {
                Some(delivery) => delivery?,
                None => {
                    warn!(queue, consumer_tag = %consumer_tag, "rabbitmq_consumer_stream_closed");
                    break;
                }
            };

            let delivery_tag = delivery.delivery_tag;
            let disposition = match callback(delivery).await {
                Ok(disposition) => disposition,
                Err(e) => {
                    warn!(queue, delivery_tag, error = %e, "rabbitmq_message_handler_failed");
                    Disposition::Requeue
                }
            };

            match disposition {
                Disposition::Ack => {
                    channel.ack(delivery_tag, false).await?;
                    summary.acked += 1;
                }
                Disposition::Requeue => {
                    channel.reject(delivery_tag, true).await?;
                    summary.requeued += 1;
                    debug!(queue, delivery_tag, "rabbitmq_message_requeued");
                }
            }
            self.stats
                .delivery(queue, disposition == Disposition::Ack);
        }

        info!(
            queue,
            acked = summary.acked,
            requeued = summary.requeued,
            stopped = ?summary.stopped,
            "rabbitmq_consumer_stopped"
        );
        Ok(summary)
    }

    /// Acknowledges and discards everything that arrives on `queue`.
    pub async fn black_hole(&mut self, queue: &str) -> Result<ConsumeSummary> {
        self.consume_items(queue, |delivery| async move {
            debug!(
                delivery_tag = delivery.delivery_tag,
                body = %delivery.body_str(),
                "rabbitmq_message_ignored"
            );
            Ok(Disposition::Ack)
        })
        .await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.manager.close().await
    }
}
