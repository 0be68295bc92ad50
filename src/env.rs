use std::env;

use dotenv::dotenv;
use tracing::debug;

use crate::config::RabbitConfig;
use crate::rabbitmq::errors::Result;

/// Settings taken from the environment (and `.env`) that win over the
/// config file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvOverrides {
    pub amqp_addr: Option<String>,
    pub exchange: Option<String>,
    pub retry_delay_ms: Option<u64>,
    pub prefetch_count: Option<u16>,
    pub worker_capacity: Option<usize>,
}

impl EnvOverrides {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the overrides through `lookup`, so callers can supply values
    /// without touching the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Ok(EnvOverrides {
            amqp_addr: non_empty("AMQP_ADDR"),
            exchange: non_empty("AMQP_EXCHANGE"),
            retry_delay_ms: match non_empty("AMQP_RETRY_DELAY_MS") {
                Some(val) => Some(val.trim().parse()?),
                None => None,
            },
            prefetch_count: match non_empty("AMQP_PREFETCH_COUNT") {
                Some(val) => Some(val.trim().parse()?),
                None => None,
            },
            worker_capacity: match non_empty("AMQP_WORKER_CAPACITY") {
                Some(val) => Some(val.trim().parse()?),
                None => None,
            },
        })
    }

    pub fn is_empty(&self) -> bool {
        *self == EnvOverrides::default()
    }

    pub fn apply(&self, config: &mut RabbitConfig) {
        if let Some(addr) = &self.amqp_addr {
            config.connection.uri = addr.clone();
        }
        if let Some(exchange) = &self.exchange {
            config.exchange.name = exchange.clone();
        }
        if let Some(delay) = self.retry_delay_ms {
            config.connection.retry_delay_ms = delay;
        }
        if let Some(prefetch) = self.prefetch_count {
            config.consumer.prefetch_count = prefetch;
        }
        if let Some(capacity) = self.worker_capacity {
            config.worker.capacity = capacity;
        }
        debug!(overrides = ?self, "env_overrides_applied");
    }
}
