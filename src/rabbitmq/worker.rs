//! Background publish worker.
//!
//! A single task drains a bounded FIFO of work items, one at a time, on its
//! own `ConnectionManager`. Callers only wait for queue space, never for
//! broker I/O.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};

pub type WorkFuture<'a> = BoxFuture<'a, Result<()>>;

/// A deferred action. It runs on the worker's task and borrows the worker's
/// connection manager for the duration of the call.
pub type WorkItem = Box<dyn for<'a> FnOnce(&'a mut ConnectionManager) -> WorkFuture<'a> + Send>;

/// Boxes a closure as a `WorkItem`.
pub fn work_item<F>(f: F) -> WorkItem
where
    F: for<'a> FnOnce(&'a mut ConnectionManager) -> WorkFuture<'a> + Send + 'static,
{
    Box::new(f)
}

/// What `submit` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FullPolicy {
    /// Wait for a free slot.
    #[default]
    Block,
    /// Fail with `WorkerQueueFull`.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub capacity: usize,
    pub full_policy: FullPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            full_policy: FullPolicy::Block,
        }
    }
}

/// A work item that did not complete.
#[derive(Debug)]
pub enum WorkerFailure {
    Failed { sequence: u64, error: RabbitMQError },
    Panicked { sequence: u64, message: String },
}

impl WorkerFailure {
    pub fn sequence(&self) -> u64 {
        match self {
            WorkerFailure::Failed { sequence, .. } | WorkerFailure::Panicked { sequence, .. } => {
                *sequence
            }
        }
    }
}

/// Receives failures of work items. The worker keeps running afterwards.
pub trait ErrorSink: Send + Sync {
    fn report(&self, failure: WorkerFailure);
}

/// Logs failures at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, failure: WorkerFailure) {
        match failure {
            WorkerFailure::Failed { sequence, error } => {
                error!(sequence, error = %error, "publish_worker_item_failed")
            }
            WorkerFailure::Panicked { sequence, message } => {
                error!(sequence, panic = %message, "publish_worker_item_panicked")
            }
        }
    }
}

/// Handle to the worker task. Clones submit to the same queue.
#[derive(Clone)]
pub struct Worker {
    sender: mpsc::Sender<WorkItem>,
    submitted: Arc<AtomicU64>,
    completed: watch::Receiver<u64>,
    cancel: CancellationToken,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    config: WorkerConfig,
}

impl Worker {
    /// Starts the worker task on the current runtime.
    pub fn spawn(
        manager: ConnectionManager,
        config: WorkerConfig,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let (completed_tx, completed) = watch::channel(0);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(manager, receiver, completed_tx, cancel.clone(), sink));
        info!(
            capacity = config.capacity,
            full_policy = ?config.full_policy,
            "publish_worker_started"
        );

        Worker {
            sender,
            submitted: Arc::new(AtomicU64::new(0)),
            completed,
            cancel,
            handle: Arc::new(Mutex::new(Some(handle))),
            config,
        }
    }

    /// Queues `item` behind everything already submitted.
    pub async fn submit(&self, item: WorkItem) -> Result<()> {
        match self.config.full_policy {
            FullPolicy::Block => self
                .sender
                .send(item)
                .await
                .map_err(|_| RabbitMQError::WorkerUnavailable)?,
            FullPolicy::Reject => self.sender.try_send(item).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    RabbitMQError::WorkerQueueFull(self.config.capacity)
                }
                mpsc::error::TrySendError::Closed(_) => RabbitMQError::WorkerUnavailable,
            })?,
        }
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Waits until every item submitted before this call has run.
    pub async fn join(&self) -> Result<()> {
        let target = self.submitted.load(Ordering::SeqCst);
        let mut completed = self.completed.clone();
        completed
            .wait_for(|done| *done >= target)
            .await
            .map(|_| ())
            .map_err(|_| RabbitMQError::WorkerUnavailable)
    }

    /// Items submitted but not yet finished.
    pub fn pending(&self) -> u64 {
        self.submitted
            .load(Ordering::SeqCst)
            .saturating_sub(*self.completed.borrow())
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Drains the queue, then stops the task.
    pub async fn shutdown(&self) -> Result<()> {
        if self.is_running() {
            self.join().await?;
        }
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "publish_worker_join_failed");
            }
        }
        Ok(())
    }
}

async fn run(
    mut manager: ConnectionManager,
    mut receiver: mpsc::Receiver<WorkItem>,
    completed: watch::Sender<u64>,
    cancel: CancellationToken,
    sink: Arc<dyn ErrorSink>,
) {
    let mut sequence = 0u64;
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = receiver.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        sequence += 1;

        let outcome = AssertUnwindSafe(async { item(&mut manager).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => debug!(sequence, "publish_worker_item_done"),
            Ok(Err(error)) => sink.report(WorkerFailure::Failed { sequence, error }),
            Err(panic) => sink.report(WorkerFailure::Panicked {
                sequence,
                message: panic_message(panic.as_ref()),
            }),
        }
        completed.send_replace(sequence);
    }

    receiver.close();
    if let Err(e) = manager.close().await {
        warn!(error = %e, "publish_worker_close_failed");
    }
    info!(processed = sequence, "publish_worker_stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
