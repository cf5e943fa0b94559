//! Caller-facing errors.
//!
//! Every dispatch operation returns either success or one [`DispatchError`]. Collaborator
//! failures (outbox stores, producers, mappers) are wrapped in typed variants so callers
//! never see a bare transport error.
//!
//! | Variant | Raised when | Retried by the policy |
//! |---------|-------------|-----------------------|
//! | `NoHandlerFound` | a command has no handler | no |
//! | `AmbiguousHandler` | a command has several handlers | no |
//! | `Configuration` | modality mismatch, missing policy, factory failure | no |
//! | `AggregatedHandlerFailure` | some publish receivers failed | per receiver |
//! | `OutboxFull` | the outstanding ceiling is reached | no |
//! | `Handler` | handler logic failed | yes |
//! | `BrokenCircuit` | the breaker is open | no |

use crate::factory::HandlerFactoryError;
use crate::handler::HandlerError;
use crate::mapper::MapperError;
use crate::outbox::OutboxError;
use crate::producer::ProducerError;
use thiserror::Error;

/// Lookup failures in the policy registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// No policy registered under this name.
    #[error("No resilience policy registered under '{0}'")]
    NotFound(String),
}

/// Misconfiguration detected before any handler or producer runs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A handler cannot run in the requested execution mode.
    #[error("Handler {handler} cannot run in a {pipeline} pipeline for {request_type}")]
    ModalityMismatch {
        /// Offending handler type name.
        handler: String,
        /// `"synchronous"` or `"asynchronous"`.
        pipeline: &'static str,
        /// Request type name.
        request_type: &'static str,
    },

    /// The named resilience policy does not exist.
    #[error("Policy lookup failed: {0}")]
    MissingPolicy(#[from] PolicyError),

    /// The handler factory could not produce a pipeline node.
    #[error("Handler factory failed: {0}")]
    HandlerFactory(#[from] HandlerFactoryError),

    /// A reliable send was requested but no outbox is configured.
    #[error("No outbox configured for {0}")]
    MissingOutbox(&'static str),

    /// A blocking entry point was called from inside an async runtime.
    #[error("{0} is a blocking call and cannot run inside an async runtime; use the async variant")]
    BlockingInAsyncContext(&'static str),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Every failure from one publish fan-out.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} of {handlers} handlers failed for {request_type}", failures.len())]
pub struct AggregatedHandlerFailure {
    request_type: &'static str,
    handlers: usize,
    failures: Vec<DispatchError>,
}

impl AggregatedHandlerFailure {
    /// Aggregate `failures` out of `handlers` attempted receivers.
    #[must_use]
    pub const fn new(
        request_type: &'static str,
        handlers: usize,
        failures: Vec<DispatchError>,
    ) -> Self {
        Self {
            request_type,
            handlers,
            failures,
        }
    }

    /// Request type name.
    #[must_use]
    pub const fn request_type(&self) -> &'static str {
        self.request_type
    }

    /// Number of receivers attempted.
    #[must_use]
    pub const fn handlers(&self) -> usize {
        self.handlers
    }

    /// One entry per failed receiver.
    #[must_use]
    pub fn failures(&self) -> &[DispatchError] {
        &self.failures
    }

    /// Number of failed receivers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Whether no receiver failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Error returned by dispatch operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A command has no registered handler.
    #[error("No handler registered for {request_type}")]
    NoHandlerFound {
        /// Request type name.
        request_type: &'static str,
    },

    /// A command has more than one registered handler.
    #[error(
        "Command {request_type} has {count} registered handlers; a command must have exactly one"
    )]
    AmbiguousHandler {
        /// Request type name.
        request_type: &'static str,
        /// Number of registered handlers.
        count: usize,
    },

    /// Misconfiguration. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Some publish receivers failed.
    #[error(transparent)]
    AggregatedHandlerFailure(#[from] AggregatedHandlerFailure),

    /// The outbox holds too many undispatched messages.
    #[error("Outbox is full: {outstanding} outstanding messages (limit {limit})")]
    OutboxFull {
        /// Outstanding count at the time of the check.
        outstanding: usize,
        /// Configured ceiling.
        limit: usize,
    },

    /// Handler logic failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The circuit breaker of the named policy is open.
    #[error("Circuit breaker for policy '{policy}' is open")]
    BrokenCircuit {
        /// Policy name.
        policy: String,
    },

    /// The dispatch was cancelled before it finished.
    #[error("Dispatch cancelled")]
    Cancelled,

    /// Request/message mapping failed.
    #[error("Mapping failed: {0}")]
    Mapping(#[from] MapperError),

    /// The outbox store failed.
    #[error("Outbox failure: {0}")]
    Outbox(#[from] OutboxError),

    /// The producer failed to deliver.
    #[error("Delivery failed: {0}")]
    Delivery(#[from] ProducerError),
}

impl DispatchError {
    /// Whether trying again later could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Handler(_)
            | Self::Delivery(_)
            | Self::OutboxFull { .. }
            | Self::BrokenCircuit { .. }
            | Self::AggregatedHandlerFailure(_) => true,
            Self::Outbox(err) => {
                matches!(err, OutboxError::Storage(_) | OutboxError::Transaction(_))
            }
            Self::NoHandlerFound { .. }
            | Self::AmbiguousHandler { .. }
            | Self::Configuration(_)
            | Self::Cancelled
            | Self::Mapping(_) => false,
        }
    }

    /// Whether this error comes from misconfiguration rather than from execution.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoHandlerFound { .. } | Self::AmbiguousHandler { .. } | Self::Configuration(_)
        )
    }
}

/// Result alias for dispatch operations.
pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modality_mismatch_names_the_handler() {
        let err = DispatchError::from(ConfigurationError::ModalityMismatch {
            handler: "AuditHandler".to_string(),
            pipeline: "synchronous",
            request_type: "PlaceOrder",
        });
        assert!(err.to_string().contains("AuditHandler"));
        assert!(err.is_configuration());
        assert!(!err.is_transient());
    }

    #[test]
    fn aggregated_failure_counts_entries() {
        let failures = vec![
            DispatchError::from(HandlerError::new("a").with_handler("A")),
            DispatchError::from(HandlerError::new("b").with_handler("B")),
        ];
        let aggregate = AggregatedHandlerFailure::new("OrderPlaced", 3, failures);
        assert_eq!(aggregate.len(), 2);
        assert_eq!(aggregate.to_string(), "2 of 3 handlers failed for OrderPlaced");
    }

    #[test]
    fn transient_classification() {
        assert!(DispatchError::OutboxFull { outstanding: 10, limit: 10 }.is_transient());
        assert!(DispatchError::Outbox(OutboxError::Storage("io".into())).is_transient());
        let missing = OutboxError::NotFound(crate::message::MessageId::new());
        assert!(!DispatchError::Outbox(missing).is_transient());
        assert!(!DispatchError::NoHandlerFound { request_type: "X" }.is_transient());
        assert!(!DispatchError::Cancelled.is_transient());
    }

    #[test]
    fn missing_policy_is_configuration() {
        let err: DispatchError =
            ConfigurationError::from(PolicyError::NotFound("courier.handler".into())).into();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("courier.handler"));
    }
}
