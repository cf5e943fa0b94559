//! Structured dispatch events for an external observability sink.
//!
//! The dispatcher and the outbox mediator report what they do through a
//! [`DispatchObserver`]. Observers are a pass-through hook: they never influence retries
//! or outcomes, and the dispatcher works the same with [`NoopObserver`].

use crate::message::{MessageId, RoutingKey};
use std::fmt;

/// Dispatch operation that produced an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatchOperation {
    /// Command to exactly one handler.
    Send,
    /// Event to every handler.
    Publish,
    /// Reliable send through the outbox.
    Post,
}

impl DispatchOperation {
    /// Lower-case name, used as a metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Publish => "publish",
            Self::Post => "post",
        }
    }
}

impl fmt::Display for DispatchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an observed step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The step succeeded.
    Success,
    /// The step was skipped (duplicate deposit, entry already dispatched, clear in flight).
    Skipped,
    /// The step failed.
    Failure(String),
}

impl Outcome {
    /// Lower-case name, used as a metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failure(_) => "failure",
        }
    }

    /// Whether the step succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Something the dispatcher or the mediator did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchEvent {
    /// A pipeline was assembled.
    PipelineBuilt {
        /// Request type name.
        request_type: &'static str,
        /// Rendered chain, `A → B → C`.
        path: String,
    },
    /// A request went through its pipelines.
    Dispatched {
        /// Operation.
        operation: DispatchOperation,
        /// Request type name.
        request_type: &'static str,
        /// Number of pipelines run.
        handlers: usize,
        /// Outcome.
        outcome: Outcome,
    },
    /// A message was written to the outbox.
    Deposited {
        /// Topic.
        topic: RoutingKey,
        /// Message id.
        message_id: MessageId,
        /// `Skipped` for duplicate deposits.
        outcome: Outcome,
    },
    /// A message was handed to a producer.
    ClearAttempted {
        /// Topic.
        topic: RoutingKey,
        /// Message id.
        message_id: MessageId,
        /// Outcome of the send.
        outcome: Outcome,
    },
    /// An outbox entry was marked dispatched.
    MarkedDispatched {
        /// Topic.
        topic: RoutingKey,
        /// Message id.
        message_id: MessageId,
        /// `Skipped` when another clear already marked it.
        outcome: Outcome,
    },
    /// A sweep finished.
    Swept {
        /// Entries selected.
        attempted: usize,
        /// Entries dispatched.
        dispatched: usize,
        /// Entries left outstanding after a failure.
        failed: usize,
    },
}

impl DispatchEvent {
    /// Short event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PipelineBuilt { .. } => "pipeline_built",
            Self::Dispatched { .. } => "dispatched",
            Self::Deposited { .. } => "deposited",
            Self::ClearAttempted { .. } => "clear_attempted",
            Self::MarkedDispatched { .. } => "marked_dispatched",
            Self::Swept { .. } => "swept",
        }
    }
}

/// Receives dispatch events.
pub trait DispatchObserver: Send + Sync {
    /// Called synchronously at the point the event happens. Must not block.
    fn on_event(&self, event: &DispatchEvent);
}

/// Observer that discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl DispatchObserver for NoopObserver {
    fn on_event(&self, _event: &DispatchEvent) {}
}
