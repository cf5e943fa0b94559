//! Per-topic publication settings.
//!
//! A [`Publication`] describes where a producer publishes and what every message it
//! sends should carry. It is resolved once per producer and never changes afterwards.

use crate::message::RoutingKey;
use crate::request::Request;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Default source identifier stamped on outgoing messages.
pub const DEFAULT_SOURCE: &str = "courier://dispatcher";

/// Static configuration for one topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    topic: RoutingKey,
    source: String,
    request_type: Option<String>,
    subject: Option<String>,
    reply_to: Option<String>,
    default_headers: HashMap<String, Value>,
    max_in_flight: Option<usize>,
}

impl Publication {
    /// Publication for `topic` with default settings.
    #[must_use]
    pub fn new(topic: impl Into<RoutingKey>) -> Self {
        Self {
            topic: topic.into(),
            source: DEFAULT_SOURCE.to_string(),
            request_type: None,
            subject: None,
            reply_to: None,
            default_headers: HashMap::new(),
            max_in_flight: None,
        }
    }

    /// Declare the request type published on this topic.
    #[must_use]
    pub fn for_request<R: Request>(mut self) -> Self {
        self.request_type = Some(std::any::type_name::<R>().to_string());
        self
    }

    /// Declare the request type by name (must match [`Request::request_type`]).
    #[must_use]
    pub fn for_request_named(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = Some(request_type.into());
        self
    }

    /// Set the source identifier.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set the subject.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the reply-to address.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Add a header that every message on this topic must carry.
    #[must_use]
    pub fn with_default_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.default_headers.insert(key.into(), value.into());
        self
    }

    /// Limit on messages in flight for this topic.
    #[must_use]
    pub const fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = Some(max);
        self
    }

    /// Topic.
    #[must_use]
    pub const fn topic(&self) -> &RoutingKey {
        &self.topic
    }

    /// Source identifier.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Request type name published on this topic.
    #[must_use]
    pub fn request_type(&self) -> Option<&str> {
        self.request_type.as_deref()
    }

    /// Subject.
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Reply-to address.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Headers every message must carry.
    #[must_use]
    pub const fn default_headers(&self) -> &HashMap<String, Value> {
        &self.default_headers
    }

    /// In-flight limit.
    #[must_use]
    pub const fn max_in_flight(&self) -> Option<usize> {
        self.max_in_flight
    }
}
