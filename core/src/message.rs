//! Outgoing messages.
//!
//! A [`Message`] is what the outbox stores and what a producer sends: a header with
//! routing and correlation metadata plus an opaque body. Messages are immutable once
//! built; anything that needs a changed message (bumping the delivery count, for
//! instance) produces a new value.
//!
//! The body format is not the dispatcher's concern. Mappers decide how requests turn into
//! bytes and record the content type in the header.

use crate::request::{RequestId, RequestKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Default content type for message bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Natural key of a message and of its outbox entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<RequestId> for MessageId {
    fn from(id: RequestId) -> Self {
        Self(id.as_uuid())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Topic (routing key) a message is published to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Create a routing key.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    /// The topic as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the key is empty (no explicit topic).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoutingKey {
    fn from(topic: &str) -> Self {
        Self::new(topic)
    }
}

impl From<String> for RoutingKey {
    fn from(topic: String) -> Self {
        Self(topic)
    }
}

/// What the message carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// A command for exactly one consumer.
    Command,
    /// An event for any number of consumers.
    Event,
    /// A document.
    Document,
    /// Unknown or unset; a store returns this for a missing message.
    None,
}

impl From<RequestKind> for MessageType {
    fn from(kind: RequestKind) -> Self {
        match kind {
            RequestKind::Command => Self::Command,
            RequestKind::Event => Self::Event,
            RequestKind::Document => Self::Document,
        }
    }
}

/// Message metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    id: MessageId,
    topic: RoutingKey,
    message_type: MessageType,
    type_name: Option<String>,
    correlation_id: Option<Uuid>,
    partition_key: Option<String>,
    content_type: String,
    timestamp: DateTime<Utc>,
    handled_count: u32,
    delay_ms: u64,
    reply_to: Option<String>,
    source: Option<String>,
    trace_parent: Option<String>,
    trace_state: Option<String>,
    bag: HashMap<String, Value>,
}

impl MessageHeader {
    /// Header with the required fields; the rest take defaults.
    #[must_use]
    pub fn new(id: MessageId, topic: RoutingKey, message_type: MessageType) -> Self {
        Self {
            id,
            topic,
            message_type,
            type_name: None,
            correlation_id: None,
            partition_key: None,
            content_type: JSON_CONTENT_TYPE.to_string(),
            timestamp: Utc::now(),
            handled_count: 0,
            delay_ms: 0,
            reply_to: None,
            source: None,
            trace_parent: None,
            trace_state: None,
            bag: HashMap::new(),
        }
    }

    /// Set the request type name (used for fallback producer routing).
    #[must_use]
    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub const fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Set the partition key.
    #[must_use]
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Set the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Set the creation timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Set the delivery (handled) count.
    #[must_use]
    pub const fn with_handled_count(mut self, count: u32) -> Self {
        self.handled_count = count;
        self
    }

    /// Request a delivery delay in milliseconds.
    #[must_use]
    pub const fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Set the reply-to address.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Set the source identifier.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set W3C trace context fields.
    #[must_use]
    pub fn with_trace(
        mut self,
        trace_parent: impl Into<String>,
        trace_state: Option<String>,
    ) -> Self {
        self.trace_parent = Some(trace_parent.into());
        self.trace_state = trace_state;
        self
    }

    /// Add a header bag entry.
    #[must_use]
    pub fn with_bag_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bag.insert(key.into(), value.into());
        self
    }

    /// Message id.
    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.id
    }

    /// Topic.
    #[must_use]
    pub const fn topic(&self) -> &RoutingKey {
        &self.topic
    }

    /// Message type.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Request type name, if recorded.
    #[must_use]
    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    /// Correlation id.
    #[must_use]
    pub const fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    /// Partition key.
    #[must_use]
    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    /// Content type.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Creation timestamp.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// How many times delivery has been attempted by consumers.
    #[must_use]
    pub const fn handled_count(&self) -> u32 {
        self.handled_count
    }

    /// Requested delivery delay in milliseconds.
    #[must_use]
    pub const fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    /// Reply-to address.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Source identifier.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// W3C `traceparent`.
    #[must_use]
    pub fn trace_parent(&self) -> Option<&str> {
        self.trace_parent.as_deref()
    }

    /// W3C `tracestate`.
    #[must_use]
    pub fn trace_state(&self) -> Option<&str> {
        self.trace_state.as_deref()
    }

    /// Extra header values.
    #[must_use]
    pub const fn bag(&self) -> &HashMap<String, Value> {
        &self.bag
    }
}

/// Opaque message payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    bytes: Vec<u8>,
    content_type: String,
}

impl MessageBody {
    /// Wrap raw bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }

    /// Serialize `value` as JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if `value` cannot be serialized.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?, JSON_CONTENT_TYPE))
    }

    /// Raw bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Body as UTF-8, if it is valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// Content type of the body.
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }
}

/// Header plus body. One message corresponds to one outbox entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    header: MessageHeader,
    body: MessageBody,
}

impl Message {
    /// Assemble a message.
    #[must_use]
    pub const fn new(header: MessageHeader, body: MessageBody) -> Self {
        Self { header, body }
    }

    /// Message id.
    #[must_use]
    pub const fn id(&self) -> MessageId {
        self.header.id
    }

    /// Topic.
    #[must_use]
    pub const fn topic(&self) -> &RoutingKey {
        &self.header.topic
    }

    /// Header.
    #[must_use]
    pub const fn header(&self) -> &MessageHeader {
        &self.header
    }

    /// Body.
    #[must_use]
    pub const fn body(&self) -> &MessageBody {
        &self.body
    }

    /// A copy of this message with the handled count bumped by one.
    #[must_use]
    pub fn with_handled_count_incremented(&self) -> Self {
        let mut header = self.header.clone();
        header.handled_count = header.handled_count.saturating_add(1);
        Self::new(header, self.body.clone())
    }

    /// A copy of this message carrying a delivery delay.
    #[must_use]
    pub fn with_delay_ms(&self, delay_ms: u64) -> Self {
        Self::new(self.header.clone().with_delay_ms(delay_ms), self.body.clone())
    }
}
