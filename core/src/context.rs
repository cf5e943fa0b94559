//! Per-dispatch request context.
//!
//! A [`RequestContext`] is created once per dispatch and threaded through every
//! node of a pipeline. Handlers use its bag to share state along the chain
//! (a validation step can stash a normalized value for the terminal handler, for example).
//!
//! The context is owned by the dispatch call that created it and is never shared
//! between concurrent dispatches. When an event fans out to several handlers each
//! pipeline receives its own [`RequestContext::create_copy`].

use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Mutable key/value bag plus dispatch metadata.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    bag: HashMap<String, Value>,
    partition_key: Option<String>,
    correlation_id: Option<Uuid>,
    span: Option<tracing::Span>,
    cancellation: CancellationToken,
}

impl RequestContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the partition hint carried onto outgoing messages.
    #[must_use]
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Set the correlation id carried onto outgoing messages.
    #[must_use]
    pub const fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Attach a parent tracing span; dispatch spans are created as its children.
    #[must_use]
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Use the given token to observe cancellation.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Read a value from the bag.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.bag.get(key)
    }

    /// Insert a value into the bag, returning the previous value for the key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.bag.insert(key.into(), value.into())
    }

    /// Remove a value from the bag.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.bag.remove(key)
    }

    /// Whether the bag holds `key`.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.bag.contains_key(key)
    }

    /// The whole bag.
    #[must_use]
    pub const fn bag(&self) -> &HashMap<String, Value> {
        &self.bag
    }

    /// Partition hint, if any.
    #[must_use]
    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    /// Correlation id, if any.
    #[must_use]
    pub const fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    /// Parent tracing span, if any.
    #[must_use]
    pub const fn span(&self) -> Option<&tracing::Span> {
        self.span.as_ref()
    }

    /// Cancellation token observed by the pipeline.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the dispatch has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Copy for an independent pipeline.
    ///
    /// The bag is deep-copied so writes in one pipeline are invisible to the others.
    /// Span and cancellation token are shared: all copies belong to the same dispatch.
    #[must_use]
    pub fn create_copy(&self) -> Self {
        self.clone()
    }
}
