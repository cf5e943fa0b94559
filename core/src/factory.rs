//! Handler factories: the create/release pair that owns handler lifetimes.
//!
//! The pipeline builder never constructs handlers itself. It asks a factory for an
//! instance of each handler type in the chain and hands every instance back through
//! `release` when the pipeline is torn down. Whether `release` drops, pools or
//! returns an instance to a container is the factory's business.
//!
//! Factories expose generic methods, so the builder is generic over the factory type
//! rather than holding a trait object.

use crate::handler::{AsyncRequestHandler, HandlerType, RequestHandler};
use crate::request::Request;
use thiserror::Error;

/// Errors raised while creating handler instances.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerFactoryError {
    /// The factory has no recipe for this handler type.
    #[error("No factory registered for handler {0}")]
    NotRegistered(String),

    /// The handler type is registered, but not for this request type.
    #[error("Handler {handler} is not registered for request type {request_type}")]
    WrongRequestType {
        /// Handler type name.
        handler: String,
        /// Request type name.
        request_type: String,
    },

    /// The constructor itself failed.
    #[error("Failed to construct handler {handler}: {reason}")]
    Construction {
        /// Handler type name.
        handler: String,
        /// Reason reported by the constructor.
        reason: String,
    },
}

/// Creates and releases blocking handlers.
pub trait HandlerFactory: Send + Sync {
    /// Create an instance of `handler` for requests of type `R`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerFactoryError`] when the handler cannot be produced.
    fn create<R: Request>(
        &self,
        handler: &HandlerType,
    ) -> Result<Box<dyn RequestHandler<R>>, HandlerFactoryError>;

    /// Release an instance previously returned by [`HandlerFactory::create`].
    fn release<R: Request>(&self, handler: &HandlerType, instance: Box<dyn RequestHandler<R>>);
}

/// Creates and releases async handlers.
pub trait AsyncHandlerFactory: Send + Sync {
    /// Create an instance of `handler` for requests of type `R`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerFactoryError`] when the handler cannot be produced.
    fn create_async<R: Request>(
        &self,
        handler: &HandlerType,
    ) -> Result<Box<dyn AsyncRequestHandler<R>>, HandlerFactoryError>;

    /// Release an instance previously returned by [`AsyncHandlerFactory::create_async`].
    fn release_async<R: Request>(
        &self,
        handler: &HandlerType,
        instance: Box<dyn AsyncRequestHandler<R>>,
    );
}
