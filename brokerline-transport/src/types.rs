use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

use crate::AckError;

pub type Headers = HashMap<String, String>;

/// Queue, topic or channel name plus an optional routing/partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
}

impl Destination {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routing_key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }
}

impl From<&str> for Destination {
    fn from(name: &str) -> Self {
        Destination::new(name)
    }
}

impl From<String> for Destination {
    fn from(name: String) -> Self {
        Destination::new(name)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.routing_key {
            Some(key) => write!(f, "{}[{}]", self.name, key),
            None => write!(f, "{}", self.name),
        }
    }
}

/// How a transport delivers messages; drives the dispatcher's retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryModel {
    Queue,
    PartitionedLog,
    PubSub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub model: DeliveryModel,
    /// Whether `nack(.., requeue = true)` redelivers the message.
    pub requeue: bool,
}

impl Capabilities {
    pub fn queue() -> Self {
        Self {
            model: DeliveryModel::Queue,
            requeue: true,
        }
    }

    pub fn partitioned_log() -> Self {
        Self {
            model: DeliveryModel::PartitionedLog,
            requeue: false,
        }
    }

    pub fn pub_sub() -> Self {
        Self {
            model: DeliveryModel::PubSub,
            requeue: false,
        }
    }
}

/// A message on its way to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_id: String,
    pub destination: Destination,
    pub body: Vec<u8>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default = "utc_now")]
    pub published_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(destination: impl Into<Destination>, body: Vec<u8>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            destination: destination.into(),
            body,
            headers: Headers::new(),
            content_type: None,
            correlation_id: None,
            reply_to: None,
            published_at: utc_now(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Single-use authorization to settle one delivery.
///
/// Clones share the consumed flag, so settling through any clone marks every
/// other clone as spent and a second settlement attempt is reported as
/// [`AckError::AlreadyConsumed`].
#[derive(Debug, Clone)]
pub struct AckHandle {
    delivery_id: Uuid,
    destination: String,
    consumed: Arc<AtomicBool>,
}

impl AckHandle {
    pub fn new(destination: impl Into<String>, delivery_id: Uuid) -> Self {
        Self {
            delivery_id,
            destination: destination.into(),
            consumed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn delivery_id(&self) -> Uuid {
        self.delivery_id
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }

    /// Spend the handle, yielding the token a transport settles with.
    pub fn consume(&self) -> Result<DeliveryToken, AckError> {
        if self.consumed.swap(true, Ordering::AcqRel) {
            return Err(AckError::AlreadyConsumed(self.delivery_id));
        }
        Ok(DeliveryToken {
            delivery_id: self.delivery_id,
            destination: self.destination.clone(),
        })
    }
}

/// Proof that an [`AckHandle`] was consumed; transports take it by value.
#[derive(Debug)]
pub struct DeliveryToken {
    delivery_id: Uuid,
    destination: String,
}

impl DeliveryToken {
    /// Rebuild a token on the far side of a remote transport.
    pub fn from_wire(destination: impl Into<String>, delivery_id: Uuid) -> Self {
        Self {
            delivery_id,
            destination: destination.into(),
        }
    }

    pub fn delivery_id(&self) -> Uuid {
        self.delivery_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

/// One received message.
///
/// Fields are read-only; middleware that wants inner layers to see a different
/// message builds a modified copy with the `with_*` methods.
#[derive(Debug, Clone)]
pub struct Envelope {
    message: OutboundMessage,
    delivery_count: u32,
    ack: AckHandle,
    decoded: Arc<OnceLock<Value>>,
}

impl Envelope {
    pub fn new(message: OutboundMessage, ack: AckHandle, delivery_count: u32) -> Self {
        Self {
            message,
            delivery_count,
            ack,
            decoded: Arc::new(OnceLock::new()),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message.message_id
    }

    pub fn destination(&self) -> &Destination {
        &self.message.destination
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.message.destination.routing_key.as_deref()
    }

    pub fn body(&self) -> &[u8] {
        &self.message.body
    }

    pub fn headers(&self) -> &Headers {
        &self.message.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.message.headers.get(name).map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.message.content_type.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.message.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.message.reply_to.as_deref()
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.message.published_at
    }

    /// Number of times the transport has handed this message out, starting at 1.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn ack_handle(&self) -> &AckHandle {
        &self.ack
    }

    /// Decoded payload, materialized on first use and cached for every clone.
    pub fn decoded_with<E, F>(&self, decode: F) -> Result<&Value, E>
    where
        F: FnOnce(&[u8], Option<&str>) -> Result<Value, E>,
    {
        if let Some(value) = self.decoded.get() {
            return Ok(value);
        }
        let value = decode(&self.message.body, self.message.content_type.as_deref())?;
        Ok(self.decoded.get_or_init(|| value))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>, content_type: Option<String>) -> Self {
        self.message.body = body;
        self.message.content_type = content_type;
        self.decoded = Arc::new(OnceLock::new());
        self
    }

    pub fn message(&self) -> &OutboundMessage {
        &self.message
    }
}

fn utc_now() -> DateTime<Utc> {
    Utc::now()
}
