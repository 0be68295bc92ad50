//! Hooks for an external metrics recorder.

use tracing::info;

use super::amqp_client::PublishOutcome;

/// How a fetched batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Acked,
    Rejected,
    /// The caller asked not to acknowledge; the callback owns the messages.
    LeftUnacked,
}

/// Receives counts from publishers and consumers. Every method defaults to
/// doing nothing.
pub trait StatsRecorder: Send + Sync {
    fn publish(&self, _exchange: &str, _routing_key: &str, _outcome: &PublishOutcome) {}

    fn batch(&self, _queue: &str, _size: usize, _outcome: BatchOutcome) {}

    fn delivery(&self, _queue: &str, _acked: bool) {}

    fn dedup(&self, _queue: &str, _scanned: usize, _unique: usize) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsRecorder for NoopStats {}

/// Emits every count as a `tracing` event on the `rustrabbit::stats` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStats;

impl StatsRecorder for TracingStats {
    fn publish(&self, exchange: &str, routing_key: &str, outcome: &PublishOutcome) {
        info!(
            target: "rustrabbit::stats",
            exchange,
            routing_key,
            delivered = outcome.is_delivered(),
            "stats_publish"
        );
    }

    fn batch(&self, queue: &str, size: usize, outcome: BatchOutcome) {
        info!(target: "rustrabbit::stats", queue, size, outcome = ?outcome, "stats_batch");
    }

    fn delivery(&self, queue: &str, acked: bool) {
        info!(target: "rustrabbit::stats", queue, acked, "stats_delivery");
    }

    fn dedup(&self, queue: &str, scanned: usize, unique: usize) {
        info!(target: "rustrabbit::stats", queue, scanned, unique, "stats_dedup");
    }
}
