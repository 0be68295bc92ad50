//! One-shot deduplication of a queue's contents.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, info, warn};

use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use super::publisher::{send_message, Publisher};
use super::worker::work_item;
use crate::message::{DeliveryMode, Message};

const PROGRESS_EVERY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupOptions {
    /// Where unique bodies are republished. Defaults to the source queue.
    pub routing_key: Option<String>,
    /// Most messages taken off the queue in one pass.
    pub limit: usize,
    pub delivery_mode: DeliveryMode,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            routing_key: None,
            limit: 100_000,
            delivery_mode: DeliveryMode::Durable,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupReport {
    pub scanned: usize,
    pub unique: usize,
    pub republished: usize,
}

/// Drains up to `options.limit` messages from `queue`, republishes each
/// distinct body once through the publisher's worker, then acknowledges
/// every original with one cumulative ack.
///
/// Bodies are compared byte for byte. Republished messages carry only the
/// body and delivery mode: the originals' message ids and headers are not
/// copied.
///
/// If any republish fails or is unroutable, the originals are rejected with
/// requeue and a `PublishError` is returned. Bodies that did get through
/// are then present twice.
pub async fn dedup_queue(
    manager: &mut ConnectionManager,
    publisher: &Publisher,
    queue: &str,
    options: DedupOptions,
) -> Result<DedupReport> {
    if options.limit == 0 {
        return Err(RabbitMQError::ValidationError(
            "dedup limit must be at least 1".to_string(),
        ));
    }

    let channel = manager.get_channel(false).await?;
    let mut seen = HashSet::new();
    let mut bodies = Vec::new();
    let mut tags = Vec::new();

    while tags.len() < options.limit {
        let Some(delivery) = channel.get(queue).await? else {
            break;
        };
        tags.push(delivery.delivery_tag);
        if seen.insert(delivery.body.clone()) {
            bodies.push(delivery.body);
        }
        if tags.len() % PROGRESS_EVERY == 0 {
            info!(queue, scanned = tags.len(), unique = bodies.len(), "rabbitmq_dedup_progress");
        }
    }
    drop(seen);

    let mut report = DedupReport {
        scanned: tags.len(),
        unique: bodies.len(),
        republished: 0,
    };
    info!(queue, scanned = report.scanned, unique = report.unique, "rabbitmq_dedup_scanned");
    if tags.is_empty() {
        return Ok(report);
    }

    let routing_key = options.routing_key.as_deref().unwrap_or(queue).to_string();
    let failures = Arc::new(AtomicUsize::new(0));
    for body in bodies {
        let message = Message::new(routing_key.clone(), body).with_delivery_mode(options.delivery_mode);
        let exchange = publisher.exchange().to_string();
        let failures = failures.clone();
        let submitted = publisher
            .worker()
            .submit(work_item(move |manager| {
                async move {
                    match send_message(manager, &exchange, &message).await {
                        Ok(outcome) if outcome.is_delivered() => Ok(()),
                        Ok(_) => {
                            failures.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                        Err(e) => {
                            failures.fetch_add(1, Ordering::SeqCst);
                            Err(e)
                        }
                    }
                }
                .boxed()
            }))
            .await;
        if let Err(e) = submitted {
            reject_all(&channel, queue, &tags).await;
            return Err(e);
        }
        report.republished += 1;
    }
    publisher.worker().join().await?;

    let failed = failures.load(Ordering::SeqCst);
    if failed > 0 {
        error!(queue, failed, republished = report.republished, "rabbitmq_dedup_republish_failed");
        reject_all(&channel, queue, &tags).await;
        return Err(RabbitMQError::PublishError(format!(
            "{} of {} republishes to '{}' failed; originals requeued",
            failed, report.republished, routing_key
        )));
    }

    let highest = tags.iter().copied().max().unwrap_or_default();
    channel.ack(highest, true).await?;
    publisher
        .stats()
        .dedup(queue, report.scanned, report.unique);
    info!(
        queue,
        routing_key = %routing_key,
        scanned = report.scanned,
        republished = report.republished,
        "rabbitmq_dedup_complete"
    );
    Ok(report)
}

async fn reject_all(channel: &super::amqp_client::Channel, queue: &str, tags: &[u64]) {
    for &tag in tags {
        if let Err(e) = channel.reject(tag, true).await {
            warn!(queue, delivery_tag = tag, error = %e, "rabbitmq_reject_failed");
        }
    }
}
