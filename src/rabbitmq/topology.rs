//! Exchange, queue and binding definitions declared on every new connection.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::errors::{RabbitMQError, Result};

pub const DEFAULT_EXCHANGE: &str = "reddit_exchange";

/// The single direct exchange messages are published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeDefinition {
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDefinition {
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    /// Bind the queue to the exchange with its own name as routing key.
    #[serde(default)]
    pub bind_to_self: bool,
}

fn default_true() -> bool {
    true
}

impl Default for QueueDefinition {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            bind_to_self: false,
        }
    }
}

impl QueueDefinition {
    pub fn bound_to_self() -> Self {
        Self {
            bind_to_self: true,
            ..Self::default()
        }
    }
}

/// A `(queue, routing_key)` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Binding {
    pub queue: String,
    pub routing_key: String,
}

/// Immutable topology, shared read-only by every connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    exchange: ExchangeDefinition,
    queues: BTreeMap<String, QueueDefinition>,
    bindings: BTreeSet<Binding>,
}

impl Topology {
    pub fn builder(exchange: impl Into<String>) -> TopologyBuilder {
        TopologyBuilder {
            exchange: ExchangeDefinition::direct(exchange),
            queues: BTreeMap::new(),
            bindings: BTreeSet::new(),
            unknown: Vec::new(),
        }
    }

    /// A topology with just the exchange; useful for publishers that never
    /// own queues.
    pub fn exchange_only(exchange: impl Into<String>) -> Self {
        Self {
            exchange: ExchangeDefinition::direct(exchange),
            queues: BTreeMap::new(),
            bindings: BTreeSet::new(),
        }
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.get(name)
    }

    pub fn queues(&self) -> impl Iterator<Item = (&str, &QueueDefinition)> {
        self.queues.iter().map(|(name, def)| (name.as_str(), def))
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }
}

pub struct TopologyBuilder {
    exchange: ExchangeDefinition,
    queues: BTreeMap<String, QueueDefinition>,
    bindings: BTreeSet<Binding>,
    unknown: Vec<String>,
}

impl TopologyBuilder {
    /// Adds a queue. Redeclaring a name replaces the earlier definition.
    pub fn queue(mut self, name: impl Into<String>, definition: QueueDefinition) -> Self {
        let name = name.into();
        if definition.bind_to_self {
            self.bindings.insert(Binding {
                queue: name.clone(),
                routing_key: name.clone(),
            });
        }
        self.queues.insert(name, definition);
        self
    }

    /// Binds `queue` to the exchange under each routing key.
    pub fn bind<I, K>(mut self, queue: &str, routing_keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        if !self.queues.contains_key(queue) {
            self.unknown.push(queue.to_string());
        }
        for routing_key in routing_keys {
            self.bindings.insert(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.into(),
            });
        }
        self
    }

    pub fn build(self) -> Result<Topology> {
        if let Some(queue) = self.unknown.first() {
            return Err(RabbitMQError::ValidationError(format!(
                "binding refers to undeclared queue '{}'",
                queue
            )));
        }
        if self.exchange.name.is_empty() {
            return Err(RabbitMQError::ValidationError(
                "exchange name cannot be empty".to_string(),
            ));
        }
        Ok(Topology {
            exchange: self.exchange,
            queues: self.queues,
            bindings: self.bindings,
        })
    }
}
