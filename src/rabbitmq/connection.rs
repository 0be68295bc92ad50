use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::amqp_client::{BrokerConnection, Channel, Connector};
use super::errors::{RabbitMQError, Result};
use super::topology::Topology;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Hands out one `ConnectionManager` per owning task.
///
/// Managers built by the same factory share the connector and the
/// topology, never the connection.
#[derive(Clone)]
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    topology: Arc<Topology>,
    retry_delay: Duration,
}

impl ConnectionFactory {
    pub fn new(connector: Arc<dyn Connector>, topology: Topology) -> Self {
        ConnectionFactory {
            connector,
            topology: Arc::new(topology),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn manager(&self) -> ConnectionManager {
        ConnectionManager::new(self.connector.clone(), self.topology.clone())
            .with_retry_delay(self.retry_delay)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }
}

/// Owns exactly one broker connection and at most one channel.
///
/// Not shared: each consumer, publisher worker or maintenance task holds
/// its own manager.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    topology: Arc<Topology>,
    retry_delay: Duration,
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Channel>,
    initialized: bool,
    confirms_enabled: bool,
    reconnect_attempts: u64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, topology: Arc<Topology>) -> Self {
        ConnectionManager {
            connector,
            topology,
            retry_delay: DEFAULT_RETRY_DELAY,
            connection: None,
            channel: None,
            initialized: false,
            confirms_enabled: false,
            reconnect_attempts: 0,
        }
    }

    /// Fixed delay between connection attempts. There is no backoff and
    /// no attempt limit.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Whether topology has been declared on the current connection.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Failed connection attempts since this manager was created.
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts
    }

    /// Returns the live connection, connecting first if needed.
    ///
    /// Connection failures are logged and retried forever, so an
    /// unreachable broker blocks the caller here. Only a failure to declare
    /// topology on a fresh connection is returned as an error.
    pub async fn get_connection(&mut self) -> Result<Arc<dyn BrokerConnection>> {
        if let Some(connection) = &self.connection {
            if !connection.is_connected() {
                warn!(broker = %self.connector.describe(), "rabbitmq_connection_lost");
                self.forget();
            }
        }

        let connection = loop {
            if let Some(connection) = &self.connection {
                break connection.clone();
            }
            match self.connector.connect().await {
                Ok(connection) => {
                    info!(broker = %self.connector.describe(), "rabbitmq_connection_established");
                    self.connection = Some(connection);
                }
                Err(err) => {
                    self.reconnect_attempts += 1;
                    error!(
                        broker = %self.connector.describe(),
                        attempt = self.reconnect_attempts,
                        retry_in_ms = self.retry_delay.as_millis() as u64,
                        error = %err,
                        "rabbitmq_connect_failed"
                    );
                    sleep(self.retry_delay).await;
                }
            }
        };

        if !self.initialized {
            self.declare_topology().await?;
            self.initialized = true;
        }

        Ok(connection)
    }

    /// Returns the cached channel. With `reconnect`, the current connection
    /// is discarded first and topology is declared again.
    pub async fn get_channel(&mut self, reconnect: bool) -> Result<Channel> {
        if reconnect {
            self.discard().await;
        }
        self.get_connection().await?;
        self.open_channel().await
    }

    /// Channel in publisher-confirm mode. Confirm mode is enabled once per
    /// channel.
    pub async fn confirm_channel(&mut self) -> Result<Channel> {
        let channel = self.get_channel(false).await?;
        if !self.confirms_enabled {
            channel.enable_confirms().await?;
            self.confirms_enabled = true;
            debug!("rabbitmq_confirm_mode_enabled");
        }
        Ok(channel)
    }

    // Reuses the cached channel while it is open.
    async fn open_channel(&mut self) -> Result<Channel> {
        if let Some(channel) = &self.channel {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            debug!("rabbitmq_channel_closed_reopening");
        }
        let connection = self.connection.clone().ok_or_else(|| {
            RabbitMQError::ConnectionError("No active connection".to_string())
        })?;
        let channel = connection.create_channel().await?;
        self.channel = Some(channel.clone());
        self.confirms_enabled = false;
        Ok(channel)
    }

    async fn declare_topology(&mut self) -> Result<()> {
        let channel = self.open_channel().await?;
        let topology = self.topology.clone();
        let exchange = topology.exchange();

        channel.declare_exchange(exchange).await?;
        for (name, definition) in topology.queues() {
            channel.declare_queue(name, definition).await?;
        }
        for binding in topology.bindings() {
            channel
                .bind_queue(&binding.queue, &exchange.name, &binding.routing_key)
                .await?;
        }

        info!(
            exchange = %exchange.name,
            queues = topology.queues().count(),
            bindings = topology.binding_count(),
            "rabbitmq_topology_declared"
        );
        Ok(())
    }

    fn forget(&mut self) {
        self.connection = None;
        self.channel = None;
        self.initialized = false;
        self.confirms_enabled = false;
    }

    async fn discard(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }
        self.forget();
    }

    /// Closes the connection gracefully.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.take() {
            info!("Closing RabbitMQ connection gracefully");
            connection.close().await?;
        }
        self.forget();
        Ok(())
    }
}
