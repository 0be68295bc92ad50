//! In-memory broker for tests and local runs.
//!
//! It mirrors the broker behavior the queue components rely on:
//! - direct exchange routing with the default exchange as a fallback
//! - per-channel, monotonically increasing delivery tags
//! - cumulative acknowledgement and reject with requeue
//! - prefetch windows on push consumers
//! - mandatory returns for unroutable messages
//! - requeue of unacknowledged messages when a channel or connection closes
//!
//! Every channel operation is recorded in a journal so tests can assert on
//! what was sent to the broker.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;

use super::amqp_client::{
    BrokerChannel, BrokerConnection, Channel, Connector, DeliveryStream, PublishOutcome,
};
use super::errors::{RabbitMQError, Result};
use super::topology::{ExchangeDefinition, QueueDefinition};
use crate::message::{Delivery, DeliveryMode, Headers, Message};

/// One operation issued on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    DeclareExchange { name: String },
    DeclareQueue { name: String },
    Bind { queue: String, exchange: String, routing_key: String },
    ConfirmSelect,
    Publish(PublishRecord),
    Get { queue: String },
    Ack { delivery_tag: u64, multiple: bool },
    Reject { delivery_tag: u64, requeue: bool },
    Qos { prefetch_count: u16 },
    Consume { queue: String, consumer_tag: String },
    Cancel { consumer_tag: String },
    Purge { queue: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub channel_id: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub mandatory: bool,
    pub confirm_mode: bool,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    message_id: Option<String>,
    delivery_mode: DeliveryMode,
    headers: Option<Headers>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    messages: VecDeque<StoredMessage>,
}

#[derive(Debug)]
struct ChannelState {
    generation: u64,
    open: bool,
    confirms: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    consumers: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, MemoryQueue>,
    bindings: HashSet<(String, String, String)>,
    channels: HashMap<u64, ChannelState>,
    next_channel_id: u64,
    generation: u64,
    fail_connects: u32,
    connect_attempts: u32,
    connections_opened: u32,
    acked: usize,
    rejected: usize,
    requeued: usize,
    journal: Vec<BrokerCall>,
}

impl State {
    fn channel(&mut self, id: u64) -> Result<&mut ChannelState> {
        let generation = self.generation;
        match self.channels.get_mut(&id) {
            Some(channel) if channel.open && channel.generation == generation => Ok(channel),
            _ => Err(RabbitMQError::ChannelError(format!("channel {} is closed", id))),
        }
    }

    fn requeue(&mut self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(q) = self.queues.get_mut(queue) {
            q.messages.push_front(message);
            self.requeued += 1;
        }
    }

    /// Closes the channel and returns its unacknowledged messages to their
    /// queues, oldest first.
    fn close_channel(&mut self, id: u64) {
        let unacked = match self.channels.get_mut(&id) {
            Some(channel) => {
                channel.open = false;
                channel.consumers.clear();
                std::mem::take(&mut channel.unacked)
            }
            None => return,
        };
        for (_, (queue, message)) in unacked.into_iter().rev() {
            self.requeue(&queue, message);
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }
        if !self.exchanges.contains_key(exchange) {
            return Err(RabbitMQError::PublishError(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }
        let mut queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|(ex, rk, _)| ex == exchange && rk == routing_key)
            .map(|(_, _, queue)| queue.clone())
            .collect();
        queues.sort();
        Ok(queues)
    }

    fn take_next(&mut self, channel_id: u64, queue: &str) -> Result<Option<Delivery>> {
        self.channel(channel_id)?;
        let message = match self.queues.get_mut(queue) {
            Some(q) => q.messages.pop_front(),
            None => {
                return Err(RabbitMQError::ConsumeError(format!(
                    "NOT_FOUND - no queue '{}'",
                    queue
                )))
            }
        };
        let Some(message) = message else {
            return Ok(None);
        };
        let channel = self.channel(channel_id)?;
        channel.next_tag += 1;
        let delivery_tag = channel.next_tag;
        let delivery = Delivery {
            delivery_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            body: message.body.clone(),
            message_id: message.message_id.clone(),
            delivery_mode: Some(message.delivery_mode),
            headers: message.headers.clone(),
        };
        channel
            .unacked
            .insert(delivery_tag, (queue.to_string(), message));
        Ok(Some(delivery))
    }
}

struct Inner {
    state: Mutex<State>,
    changed: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changed: Notify::new(),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// The next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.state().fail_connects = count;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.inner.state().connect_attempts
    }

    pub fn connections_opened(&self) -> u32 {
        self.inner.state().connections_opened
    }

    /// Drops every open connection, as a broker restart would.
    pub fn sever_connections(&self) {
        let mut state = self.inner.state();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
        state.generation += 1;
        drop(state);
        self.inner.changed.notify_waiters();
    }

    /// Places a message straight onto a queue, creating the queue if needed.
    pub fn enqueue(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut state = self.inner.state();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .messages
            .push_back(StoredMessage {
                exchange: String::new(),
                routing_key: queue.to_string(),
                body: body.into(),
                message_id: None,
                delivery_mode: DeliveryMode::Durable,
                headers: None,
                redelivered: false,
            });
        drop(state);
        self.inner.changed.notify_waiters();
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Bodies of the ready messages in `queue`, head first.
    pub fn queue_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.inner.state().queues.contains_key(queue)
    }

    pub fn has_binding(&self, exchange: &str, routing_key: &str, queue: &str) -> bool {
        self.inner.state().bindings.contains(&(
            exchange.to_string(),
            routing_key.to_string(),
            queue.to_string(),
        ))
    }

    /// Messages delivered but not yet acknowledged, across all channels.
    pub fn unacked_count(&self) -> usize {
        self.inner
            .state()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    pub fn acked_count(&self) -> usize {
        self.inner.state().acked
    }

    pub fn rejected_count(&self) -> usize {
        self.inner.state().rejected
    }

    pub fn requeued_count(&self) -> usize {
        self.inner.state().requeued
    }

    pub fn journal(&self) -> Vec<BrokerCall> {
        self.inner.state().journal.clone()
    }

    pub fn publishes(&self) -> Vec<PublishRecord> {
        self.inner
            .state()
            .journal
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Publish(record) => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let result = f(&mut self.inner.state());
        self.inner.changed.notify_waiters();
        result
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.inner.state();
        state.connect_attempts += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(RabbitMQError::ConnectionError(
                "connection refused".to_string(),
            ));
        }
        state.connections_opened += 1;
        let generation = state.generation;
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            generation,
            closed: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    generation: u64,
    closed: AtomicBool,
    channels: Mutex<Vec<u64>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Channel> {
        if !self.is_connected() {
            return Err(RabbitMQError::ConnectionError(
                "connection is closed".to_string(),
            ));
        }
        let id = {
            let mut state = self.broker.inner.state();
            state.next_channel_id += 1;
            let id = state.next_channel_id;
            state.channels.insert(
                id,
                ChannelState {
                    generation: self.generation,
                    open: true,
                    confirms: false,
                    prefetch: 0,
                    next_tag: 0,
                    unacked: BTreeMap::new(),
                    consumers: HashSet::new(),
                },
            );
            id
        };
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(id);
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.broker.inner.state().generation == self.generation
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let ids = std::mem::take(
            &mut *self
                .channels
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        self.broker.with_state(|state| {
            for id in ids {
                state.close_channel(id);
            }
        });
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &ExchangeDefinition) -> Result<()> {
        self.broker.with_state(|state| {
            state.channel(self.id)?;
            state.journal.push(BrokerCall::DeclareExchange {
                name: exchange.name.clone(),
            });
            state
                .exchanges
                .entry(exchange.name.clone())
                .or_insert_with(|| exchange.clone());
            Ok(())
        })
    }

    async fn declare_queue(&self, name: &str, _definition: &QueueDefinition) -> Result<()> {
        self.broker.with_state(|state| {
            state.channel(self.id)?;
            state.journal.push(BrokerCall::DeclareQueue {
                name: name.to_string(),
            });
            state.queues.entry(name.to_string()).or_default();
            Ok(())
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.broker.with_state(|state| {
            state.channel(self.id)?;
            state.journal.push(BrokerCall::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
            if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
                return Err(RabbitMQError::DeclareError(format!(
                    "NOT_FOUND - cannot bind '{}' to '{}'",
                    queue, exchange
                )));
            }
            state.bindings.insert((
                exchange.to_string(),
                routing_key.to_string(),
                queue.to_string(),
            ));
            Ok(())
        })
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.broker.with_state(|state| {
            state.channel(self.id)?.confirms = true;
            state.journal.push(BrokerCall::ConfirmSelect);
            Ok(())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        message: &Message,
        mandatory: bool,
    ) -> Result<PublishOutcome> {
        self.broker.with_state(|state| {
            let confirm_mode = state.channel(self.id)?.confirms;
            state.journal.push(BrokerCall::Publish(PublishRecord {
                channel_id: self.id,
                exchange: exchange.to_string(),
                routing_key: message.routing_key().to_string(),
                body: message.body().to_vec(),
                message_id: message.message_id().map(str::to_string),
                delivery_mode: message.delivery_mode(),
                mandatory,
                confirm_mode,
            }));

            let targets = state.route(exchange, message.routing_key())?;
            if targets.is_empty() {
                return Ok(if mandatory {
                    PublishOutcome::Unroutable {
                        reply_code: 312,
                        reply_text: "NO_ROUTE".to_string(),
                    }
                } else if confirm_mode {
                    PublishOutcome::Confirmed
                } else {
                    PublishOutcome::Unconfirmed
                });
            }
            for queue in targets {
                if let Some(q) = state.queues.get_mut(&queue) {
                    q.messages.push_back(StoredMessage {
                        exchange: exchange.to_string(),
                        routing_key: message.routing_key().to_string(),
                        body: message.body().to_vec(),
                        message_id: message.message_id().map(str::to_string),
                        delivery_mode: message.delivery_mode(),
                        headers: message.headers().cloned(),
                        redelivered: false,
                    });
                }
            }
            Ok(if confirm_mode {
                PublishOutcome::Confirmed
            } else {
                PublishOutcome::Unconfirmed
            })
        })
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        self.broker.with_state(|state| {
            state.channel(self.id)?;
            state.journal.push(BrokerCall::Get {
                queue: queue.to_string(),
            });
            state.take_next(self.id, queue)
        })
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.broker.with_state(|state| {
            state.journal.push(BrokerCall::Ack {
                delivery_tag,
                multiple,
            });
            let channel = state.channel(self.id)?;
            let tags: Vec<u64> = if multiple {
                channel
                    .unacked
                    .keys()
                    .copied()
                    .filter(|tag| delivery_tag == 0 || *tag <= delivery_tag)
                    .collect()
            } else if channel.unacked.contains_key(&delivery_tag) {
                vec![delivery_tag]
            } else {
                Vec::new()
            };
            if tags.is_empty() {
                return Err(RabbitMQError::AckError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                )));
            }
            for tag in &tags {
                channel.unacked.remove(tag);
            }
            state.acked += tags.len();
            Ok(())
        })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.broker.with_state(|state| {
            state.journal.push(BrokerCall::Reject {
                delivery_tag,
                requeue,
            });
            let entry = state.channel(self.id)?.unacked.remove(&delivery_tag);
            let Some((queue, message)) = entry else {
                return Err(RabbitMQError::AckError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                )));
            };
            state.rejected += 1;
            if requeue {
                state.requeue(&queue, message);
            }
            Ok(())
        })
    }

    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()> {
        self.broker.with_state(|state| {
            state.channel(self.id)?.prefetch = prefetch_count;
            state.journal.push(BrokerCall::Qos { prefetch_count });
            Ok(())
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.broker.with_state(|state| {
            if !state.queues.contains_key(queue) {
                return Err(RabbitMQError::ConsumeError(format!(
                    "NOT_FOUND - no queue '{}'",
                    queue
                )));
            }
            state
                .channel(self.id)?
                .consumers
                .insert(consumer_tag.to_string());
            state.journal.push(BrokerCall::Consume {
                queue: queue.to_string(),
                consumer_tag: consumer_tag.to_string(),
            });
            Ok(())
        })?;

        let consumer = PushConsumer {
            broker: self.broker.clone(),
            channel_id: self.id,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
        };
        Ok(futures::stream::unfold(consumer, |consumer| async move {
            consumer
                .next_delivery()
                .await
                .map(|delivery| (Ok(delivery), consumer))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.broker.with_state(|state| {
            state.journal.push(BrokerCall::Cancel {
                consumer_tag: consumer_tag.to_string(),
            });
            state.channel(self.id)?.consumers.remove(consumer_tag);
            Ok(())
        })
    }

    async fn purge(&self, queue: &str) -> Result<u32> {
        self.broker.with_state(|state| {
            state.channel(self.id)?;
            state.journal.push(BrokerCall::Purge {
                queue: queue.to_string(),
            });
            let q = state.queues.get_mut(queue).ok_or_else(|| {
                RabbitMQError::ChannelError(format!("NOT_FOUND - no queue '{}'", queue))
            })?;
            let purged = q.messages.len() as u32;
            q.messages.clear();
            Ok(purged)
        })
    }

    fn is_open(&self) -> bool {
        self.broker.inner.state().channel(self.id).is_ok()
    }
}

struct PushConsumer {
    broker: MemoryBroker,
    channel_id: u64,
    queue: String,
    consumer_tag: String,
}

enum Step {
    Deliver(Delivery),
    Wait,
    Stop,
}

impl PushConsumer {
    /// Waits until the prefetch window has room and a message is ready.
    /// Ends when the consumer is cancelled or its channel closes.
    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            let notified = self.broker.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.broker.inner.state();
                self.step(&mut state)
            };
            match step {
                Step::Deliver(delivery) => return Some(delivery),
                Step::Stop => return None,
                Step::Wait => notified.await,
            }
        }
    }

    fn step(&self, state: &mut State) -> Step {
        let (window_full, active) = match state.channel(self.channel_id) {
            Ok(channel) => (
                channel.prefetch > 0 && channel.unacked.len() >= channel.prefetch as usize,
                channel.consumers.contains(&self.consumer_tag),
            ),
            Err(_) => return Step::Stop,
        };
        if !active {
            return Step::Stop;
        }
        if window_full {
            return Step::Wait;
        }
        match state.take_next(self.channel_id, &self.queue) {
            Ok(Some(delivery)) => Step::Deliver(delivery),
            Ok(None) => Step::Wait,
            Err(_) => Step::Stop,
        }
    }
}
