// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

/// Error returned by a consumer callback.
///
/// `anyhow::Error` and any `std::error::Error + Send + Sync` convert into it.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ declare error: {0}")]
    DeclareError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Invalid argument: {0}")]
    ValidationError(String),

    #[error("Message handler failed: {0}")]
    HandlerError(#[source] HandlerError),

    #[error("Publish worker is no longer running")]
    WorkerUnavailable,

    #[error("Publish worker queue is full (capacity {0})")]
    WorkerQueueFull(usize),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Operation cancelled")]
    Cancelled,
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// True when the failure came from the transport rather than from the
    /// caller's input or callback.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_)
                | RabbitMQError::ChannelError(_)
                | RabbitMQError::DeclareError(_)
                | RabbitMQError::PublishError(_)
                | RabbitMQError::ConsumeError(_)
                | RabbitMQError::AckError(_)
        )
    }
}

// lapin reports most failures through one error type; connection-level
// states are the only ones callers treat differently.
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        match &error {
            LapinError::InvalidConnectionState(_) | LapinError::IOError(_) => {
                RabbitMQError::ConnectionError(error.to_string())
            }
            _ => RabbitMQError::ChannelError(error.to_string()),
        }
    }
}

impl From<std::num::ParseIntError> for RabbitMQError {
    fn from(err: std::num::ParseIntError) -> Self {
        RabbitMQError::ConfigError(format!("Parse error: {}", err))
    }
}
