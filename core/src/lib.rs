//! # Courier Core
//!
//! Core traits and types for the Courier command/event dispatcher.
//!
//! This crate holds the data model and the contracts of every collaborator the
//! dispatcher talks to. It contains no execution logic; see `courier-runtime` for the
//! pipeline builder, the dispatcher and the outbox mediator.
//!
//! ## Core Concepts
//!
//! - **Request**: a command (one receiver) or an event (any number of receivers)
//! - **RequestContext**: per-dispatch key/value bag threaded through a pipeline
//! - **Handler**: one node of a pipeline, blocking or async, never both in one chain
//! - **HandlerFactory**: creates and releases handler instances
//! - **Message**: what a reliable send stores in the outbox and hands to a producer
//! - **OutboxStore / MessageProducer**: durable storage and broker transport
//! - **DispatchObserver**: structured events for an external sink
//!
//! ## Example
//!
//! ```
//! use courier_core::prelude::*;
//!
//! struct Greet {
//!     id: RequestId,
//! }
//!
//! impl Request for Greet {
//!     fn id(&self) -> RequestId {
//!         self.id
//!     }
//!
//!     fn kind(&self) -> RequestKind {
//!         RequestKind::Command
//!     }
//! }
//!
//! struct GreetHandler;
//!
//! impl RequestHandler<Greet> for GreetHandler {
//!     fn handle(&self, _greet: &Greet, context: &mut RequestContext) -> Result<(), HandlerError> {
//!         context.insert("greeted", true);
//!         Ok(())
//!     }
//! }
//!
//! let mut context = RequestContext::new();
//! GreetHandler.handle(&Greet { id: RequestId::new() }, &mut context).ok();
//! assert!(context.contains_key("greeted"));
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod context;
pub mod environment;
pub mod error;
pub mod factory;
pub mod handler;
pub mod mapper;
pub mod message;
pub mod observer;
pub mod outbox;
pub mod producer;
pub mod publication;
pub mod request;

/// Commonly used items.
pub mod prelude {
    pub use crate::context::RequestContext;
    pub use crate::environment::Clock;
    pub use crate::error::{
        AggregatedHandlerFailure, ConfigurationError, DispatchError, PolicyError,
    };
    pub use crate::factory::{AsyncHandlerFactory, HandlerFactory, HandlerFactoryError};
    pub use crate::handler::{
        AsyncRequestHandler, HandlerDescriptor, HandlerError, HandlerFuture, HandlerMarker,
        HandlerModality, HandlerTiming, HandlerType, RequestHandler,
    };
    pub use crate::mapper::{JsonMessageMapper, MapperError, MessageMapper, MessageMapperRegistry};
    pub use crate::message::{
        Message, MessageBody, MessageHeader, MessageId, MessageType, RoutingKey,
    };
    pub use crate::observer::{
        DispatchEvent, DispatchObserver, DispatchOperation, NoopObserver, Outcome,
    };
    pub use crate::outbox::{OutboxEntry, OutboxError, OutboxFuture, OutboxStore};
    pub use crate::producer::{MessageProducer, ProducerError, ProducerFuture};
    pub use crate::publication::Publication;
    pub use crate::request::{Request, RequestId, RequestKind};
}
