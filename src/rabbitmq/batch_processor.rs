// src/rabbitmq/batch_processor.rs

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::amqp_client::Channel;
use super::connection::ConnectionManager;
use super::consumer::StopReason;
use super::errors::{HandlerError, RabbitMQError, Result};
use super::stats::{BatchOutcome, NoopStats, StatsRecorder};
use crate::message::Delivery;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    /// Acknowledge the batch after the callback succeeds.
    pub ack: bool,
    /// Largest batch handed to the callback.
    pub limit: usize,
    /// Keep waiting for messages until the batch has at least this many.
    pub min_size: usize,
    /// Return instead of waiting when the queue is empty.
    pub drain: bool,
    pub sleep_time: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            ack: true,
            limit: 1,
            min_size: 0,
            drain: false,
            sleep_time: Duration::from_secs(1),
        }
    }
}

impl BatchOptions {
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(RabbitMQError::ValidationError(
                "limit must be at least 1".to_string(),
            ));
        }
        if self.min_size > self.limit {
            return Err(RabbitMQError::ValidationError(format!(
                "min_size ({}) must not exceed limit ({})",
                self.min_size, self.limit
            )));
        }
        Ok(())
    }
}

/// Result of a single `handle_batch` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStep {
    Processed(usize),
    /// `drain` was set and the queue was empty.
    Drained,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleSummary {
    pub batches: usize,
    pub messages: usize,
    pub stopped: StopReason,
}

/// Polls a queue with `basic_get` and hands the callback whole batches.
///
/// A batch is settled as a unit: a successful callback acknowledges every
/// message up to the highest delivery tag in one cumulative ack, a failed
/// one rejects every message with requeue.
pub struct BatchConsumer {
    manager: ConnectionManager,
    cancel: CancellationToken,
    stats: Arc<dyn StatsRecorder>,
}

impl BatchConsumer {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            cancel: CancellationToken::new(),
            stats: Arc::new(NoopStats),
        }
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

    pub fn manager_mut(&mut self) -> &mut ConnectionManager {
        &mut self.manager
    }

    /// Processes batches until the queue is drained (with `drain`) or the
    /// consumer is cancelled. A callback failure is returned after the
    /// batch has been requeued.
    pub async fn handle_items<F, Fut>(
        &mut self,
        queue: &str,
        options: BatchOptions,
        mut callback: F,
    ) -> Result<HandleSummary>
    where
        F: FnMut(Vec<Delivery>, Channel) -> Fut,
        Fut: Future<Output = std::result::Result<(), HandlerError>>,
    {
        options.validate()?;
        info!(
            queue,
            limit = options.limit,
            min_size = options.min_size,
            drain = options.drain,
            "rabbitmq_batch_consumer_started"
        );

        let mut summary = HandleSummary {
            batches: 0,
            messages: 0,
            stopped: StopReason::Drained,
        };
        loop {
            match self.handle_batch(queue, &options, &mut callback).await? {
                BatchStep::Processed(size) => {
                    summary.batches += 1;
                    summary.messages += size;
                }
                BatchStep::Drained => {
                    summary.stopped = StopReason::Drained;
                    break;
                }
                BatchStep::Cancelled => {
                    summary.stopped = StopReason::Cancelled;
                    break;
                }
            }
        }

        info!(
            queue,
            batches = summary.batches,
            messages = summary.messages,
            stopped = ?summary.stopped,
            "rabbitmq_batch_consumer_stopped"
        );
        Ok(summary)
    }

    /// Collects and settles one batch.
    pub async fn handle_batch<F, Fut>(
        &mut self,
        queue: &str,
        options: &BatchOptions,
        callback: &mut F,
    ) -> Result<BatchStep>
    where
        F: FnMut(Vec<Delivery>, Channel) -> Fut,
        Fut: Future<Output = std::result::Result<(), HandlerError>>,
    {
        options.validate()?;
        let channel = self.manager.get_channel(false).await?;

        let first = loop {
            if self.cancel.is_cancelled() {
                return Ok(BatchStep::Cancelled);
            }
            match channel.get(queue).await? {
                Some(delivery) => break delivery,
                None if options.drain => {
                    debug!(queue, "rabbitmq_batch_queue_drained");
                    return Ok(BatchStep::Drained);
                }
                None => {
                    if self.pause(options.sleep_time).await {
                        return Ok(BatchStep::Cancelled);
                    }
                }
            }
        };

        let mut items = Vec::with_capacity(options.limit);
        items.push(first);
        while items.len() < options.limit {
            match channel.get(queue).await? {
                Some(delivery) => items.push(delivery),
                None if items.len() >= options.min_size => break,
                None => {
                    if self.pause(options.sleep_time).await {
                        warn!(queue, size = items.len(), "rabbitmq_batch_cancelled_partial");
                        self.reject_all(&channel, queue, &items).await;
                        return Ok(BatchStep::Cancelled);
                    }
                }
            }
        }

        let size = items.len();
        let tags: Vec<u64> = items.iter().map(|d| d.delivery_tag).collect();
        debug!(queue, size, "rabbitmq_batch_collected");

        if let Err(e) = callback(items, channel.clone()).await {
            error!(queue, size, error = %e, "rabbitmq_batch_failed");
            self.reject_tags(&channel, queue, &tags).await;
            self.stats.batch(queue, size, BatchOutcome::Rejected);
            return Err(RabbitMQError::HandlerError(e));
        }

        if options.ack {
            let highest = tags.iter().copied().max().unwrap_or_default();
            channel.ack(highest, true).await?;
            debug!(queue, size, delivery_tag = highest, "rabbitmq_batch_acked");
            self.stats.batch(queue, size, BatchOutcome::Acked);
        } else {
            self.stats.batch(queue, size, BatchOutcome::LeftUnacked);
        }
        Ok(BatchStep::Processed(size))
    }

    pub async fn close(&mut self) -> Result<()> {
        self.manager.close().await
    }

    // Returns true when cancelled before the sleep finished.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = sleep(duration) => false,
        }
    }

    async fn reject_all(&self, channel: &Channel, queue: &str, items: &[Delivery]) {
        let tags: Vec<u64> = items.iter().map(|d| d.delivery_tag).collect();
        self.reject_tags(channel, queue, &tags).await;
    }

    async fn reject_tags(&self, channel: &Channel, queue: &str, tags: &[u64]) {
        for &tag in tags {
            if let Err(e) = channel.reject(tag, true).await {
                warn!(queue, delivery_tag = tag, error = %e, "rabbitmq_reject_failed");
            }
        }
    }
}
