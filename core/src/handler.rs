//! Request handlers and the descriptors used to order them.
//!
//! A handler registration has one **terminal** handler (the one that does the work for
//! the request) plus zero or more ordering markers. Each pipeline marker names a
//! decorator handler, the step at which it runs and whether it runs before or after the
//! terminal handler. Markers that are not pipeline markers ([`HandlerMarker::Foreign`])
//! are carried along and ignored by the pipeline builder.
//!
//! ```text
//! before(step 1) → before(step 2) → terminal → after(step 1) → after(step 2)
//! ```
//!
//! Handlers come in two modalities: blocking ([`RequestHandler`]) and async
//! ([`AsyncRequestHandler`]). A pipeline never mixes them.

use crate::context::RequestContext;
use crate::request::Request;
use std::any::TypeId;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Future returned by [`AsyncRequestHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Failure raised by handler logic.
///
/// Handler failures are the only errors the resilience policy retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Handler '{handler}' failed: {message}")]
pub struct HandlerError {
    handler: String,
    message: String,
    timed_out: bool,
}

impl HandlerError {
    /// Create a failure with a message. The pipeline fills in the handler name
    /// if the handler did not.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            handler: String::new(),
            message: message.into(),
            timed_out: false,
        }
    }

    /// A failure caused by an execution timeout.
    #[must_use]
    pub fn timeout(handler: impl Into<String>, after: Duration) -> Self {
        Self {
            handler: handler.into(),
            message: format!("timed out after {}ms", after.as_millis()),
            timed_out: true,
        }
    }

    /// Attribute the failure to `handler` unless it is already attributed.
    #[must_use]
    pub fn with_handler(mut self, handler: &str) -> Self {
        if self.handler.is_empty() {
            self.handler = handler.to_string();
        }
        self
    }

    /// Name of the failing handler.
    #[must_use]
    pub fn handler(&self) -> &str {
        &self.handler
    }

    /// Failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this failure is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        self.timed_out
    }
}

/// Blocking handler for requests of type `R`.
///
/// # Example
///
/// ```
/// use courier_core::context::RequestContext;
/// use courier_core::handler::{HandlerError, RequestHandler};
/// # use courier_core::request::{Request, RequestId, RequestKind};
/// # struct Ping(RequestId);
/// # impl Request for Ping {
/// #     fn id(&self) -> RequestId { self.0 }
/// #     fn kind(&self) -> RequestKind { RequestKind::Command }
/// # }
///
/// struct PingHandler;
///
/// impl RequestHandler<Ping> for PingHandler {
///     fn handle(&self, _ping: &Ping, context: &mut RequestContext) -> Result<(), HandlerError> {
///         context.insert("pong", true);
///         Ok(())
///     }
/// }
/// ```
pub trait RequestHandler<R: Request>: Send + Sync {
    /// Handler name used in pipeline traces and error messages.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Handle the request.
    ///
    /// # Errors
    ///
    /// Returns a [`HandlerError`] to abort the rest of the chain.
    fn handle(&self, request: &R, context: &mut RequestContext) -> Result<(), HandlerError>;
}

/// Async handler for requests of type `R`.
///
/// Uses an explicit boxed future so handlers can be stored as trait objects.
pub trait AsyncRequestHandler<R: Request>: Send + Sync {
    /// Handler name used in pipeline traces and error messages.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Handle the request.
    ///
    /// # Errors
    ///
    /// The returned future resolves to a [`HandlerError`] to abort the rest of the chain.
    fn handle<'a>(&'a self, request: &'a R, context: &'a mut RequestContext) -> HandlerFuture<'a>;
}

/// Identity of a handler type, independent of any instance.
#[derive(Clone, Copy)]
pub struct HandlerType {
    name: &'static str,
    id: TypeId,
}

impl HandlerType {
    /// The handler type `H`.
    #[must_use]
    pub fn of<H: 'static>() -> Self {
        Self {
            name: std::any::type_name::<H>(),
            id: TypeId::of::<H>(),
        }
    }

    /// Fully qualified type name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without its module path.
    #[must_use]
    pub fn short_name(&self) -> &'static str {
        short_type_name(self.name)
    }

    /// The handler's `TypeId`.
    #[must_use]
    pub const fn type_id(&self) -> TypeId {
        self.id
    }
}

impl PartialEq for HandlerType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for HandlerType {}

impl Hash for HandlerType {
    fn hash<S: Hasher>(&self, state: &mut S) {
        self.id.hash(state);
    }
}

impl fmt::Debug for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerType").field(&self.name).finish()
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Strip the module path (and any generic arguments' paths) from a type name.
#[must_use]
pub fn short_type_name(name: &'static str) -> &'static str {
    let base = name.split('<').next().unwrap_or(name);
    match base.rfind("::") {
        Some(idx) => &name[idx + 2..],
        None => name,
    }
}

/// Whether a decorator runs before or after the terminal handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerTiming {
    /// Runs ahead of the terminal handler.
    Before,
    /// Runs after the terminal handler succeeded.
    After,
}

/// Execution modes a handler type supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerModality {
    /// Blocking only.
    Sync,
    /// Async only.
    Async,
    /// Available in both modes.
    Both,
}

impl HandlerModality {
    /// Can run in a blocking pipeline.
    #[must_use]
    pub const fn supports_sync(&self) -> bool {
        matches!(self, Self::Sync | Self::Both)
    }

    /// Can run in an async pipeline.
    #[must_use]
    pub const fn supports_async(&self) -> bool {
        matches!(self, Self::Async | Self::Both)
    }
}

/// Ordering descriptor of one pipeline node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerDescriptor {
    /// Handler type to instantiate.
    pub handler: HandlerType,
    /// Position within its timing group; lower steps run first.
    pub step: u32,
    /// Before or after the terminal handler.
    pub timing: HandlerTiming,
    /// Supported execution modes.
    pub modality: HandlerModality,
}

impl HandlerDescriptor {
    /// Descriptor for decorator `H`.
    #[must_use]
    pub fn new<H: 'static>(step: u32, timing: HandlerTiming, modality: HandlerModality) -> Self {
        Self {
            handler: HandlerType::of::<H>(),
            step,
            timing,
            modality,
        }
    }
}

/// A declarative marker attached to a handler registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerMarker {
    /// Adds a decorator node to the pipeline.
    Pipeline(HandlerDescriptor),
    /// A decoration the pipeline builder does not understand (feature flags,
    /// documentation tags, ...). Ignored during chain assembly.
    Foreign(&'static str),
}

impl HandlerMarker {
    /// The pipeline descriptor, if this is a pipeline marker.
    #[must_use]
    pub const fn descriptor(&self) -> Option<&HandlerDescriptor> {
        match self {
            Self::Pipeline(descriptor) => Some(descriptor),
            Self::Foreign(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Alpha;
    struct Beta;

    #[test]
    fn handler_types_compare_by_type() {
        assert_eq!(HandlerType::of::<Alpha>(), HandlerType::of::<Alpha>());
        assert_ne!(HandlerType::of::<Alpha>(), HandlerType::of::<Beta>());
    }

    #[test]
    fn short_name_strips_module_path() {
        assert_eq!(HandlerType::of::<Alpha>().short_name(), "Alpha");
        assert_eq!(short_type_name("a::b::Wrapper<c::D>"), "Wrapper<c::D>");
        assert_eq!(short_type_name("Plain"), "Plain");
    }

    #[test]
    fn modality_support() {
        assert!(HandlerModality::Sync.supports_sync());
        assert!(!HandlerModality::Sync.supports_async());
        assert!(HandlerModality::Async.supports_async());
        assert!(!HandlerModality::Async.supports_sync());
        assert!(HandlerModality::Both.supports_sync());
        assert!(HandlerModality::Both.supports_async());
    }

    #[test]
    fn handler_error_keeps_first_attribution() {
        let err = HandlerError::new("boom").with_handler("First").with_handler("Second");
        assert_eq!(err.handler(), "First");
        assert_eq!(err.message(), "boom");
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "Handler 'First' failed: boom");
    }

    #[test]
    fn timeout_errors_are_flagged() {
        let err = HandlerError::timeout("Slow", Duration::from_millis(250));
        assert!(err.is_timeout());
        assert!(err.message().contains("250ms"));
    }

    #[test]
    fn foreign_markers_have_no_descriptor() {
        assert!(HandlerMarker::Foreign("audit").descriptor().is_none());
        let marker = HandlerMarker::Pipeline(HandlerDescriptor::new::<Alpha>(
            1,
            HandlerTiming::Before,
            HandlerModality::Sync,
        ));
        assert_eq!(marker.descriptor().map(|d| d.step), Some(1));
    }
}
