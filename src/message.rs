use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// AMQP delivery mode carried in the message properties.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Transient,
    #[default]
    Durable,
}

impl DeliveryMode {
    /// Wire value: transient = 1, durable = 2.
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Durable => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(DeliveryMode::Transient),
            2 => Some(DeliveryMode::Durable),
            _ => None,
        }
    }
}

/// Flat header map attached to a message.
pub type Headers = BTreeMap<String, String>;

/// An outgoing message. The body is opaque bytes; nothing in this crate
/// interprets it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    routing_key: String,
    body: Vec<u8>,
    message_id: Option<String>,
    delivery_mode: DeliveryMode,
    headers: Option<Headers>,
    timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a durable message with no id and no headers.
    pub fn new(routing_key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Message {
            routing_key: routing_key.into(),
            body: body.into(),
            message_id: None,
            delivery_mode: DeliveryMode::Durable,
            headers: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Attaches a freshly generated UUID v4 as the message id.
    pub fn with_generated_id(self) -> Self {
        self.with_message_id(Uuid::new_v4().to_string())
    }

    pub fn with_delivery_mode(mut self, delivery_mode: DeliveryMode) -> Self {
        self.delivery_mode = delivery_mode;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Headers::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// A message handed out by the broker, still awaiting acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Per-channel handle used to ack or reject this message.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub delivery_mode: Option<DeliveryMode>,
    pub headers: Option<Headers>,
}

impl Delivery {
    /// Body as UTF-8 text, lossily.
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}
