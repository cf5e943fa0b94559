//! Closure-based handler factory.
//!
//! [`SimpleHandlerFactory`] maps a (handler type, request type) pair to a constructor.
//! Released instances are dropped. Applications with a container or pooled handlers
//! implement [`HandlerFactory`] / [`AsyncHandlerFactory`] themselves.

use courier_core::factory::{AsyncHandlerFactory, HandlerFactory, HandlerFactoryError};
use courier_core::handler::{AsyncRequestHandler, HandlerType, RequestHandler};
use courier_core::request::Request;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

type Constructor<T> = Box<dyn Fn() -> T + Send + Sync>;
type Key = (TypeId, TypeId);

/// Factory backed by registered constructors.
///
/// # Example
///
/// ```
/// use courier_runtime::factory::SimpleHandlerFactory;
/// use courier_core::factory::HandlerFactory;
/// use courier_core::prelude::*;
/// # struct Ping(RequestId);
/// # impl Request for Ping {
/// #     fn id(&self) -> RequestId { self.0 }
/// #     fn kind(&self) -> RequestKind { RequestKind::Command }
/// # }
///
/// struct PingHandler;
///
/// impl RequestHandler<Ping> for PingHandler {
///     fn handle(&self, _: &Ping, _: &mut RequestContext) -> Result<(), HandlerError> {
///         Ok(())
///     }
/// }
///
/// let mut factory = SimpleHandlerFactory::new();
/// factory.register::<Ping, _>(|| PingHandler);
///
/// let handler = factory.create::<Ping>(&HandlerType::of::<PingHandler>());
/// assert!(handler.is_ok());
/// ```
#[derive(Default)]
pub struct SimpleHandlerFactory {
    sync: HashMap<Key, Box<dyn Any + Send + Sync>>,
    asynchronous: HashMap<Key, Box<dyn Any + Send + Sync>>,
}

impl SimpleHandlerFactory {
    /// Empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for blocking handler `H` of request `R`.
    pub fn register<R, H>(
        &mut self,
        constructor: impl Fn() -> H + Send + Sync + 'static,
    ) -> &mut Self
    where
        R: Request,
        H: RequestHandler<R> + 'static,
    {
        let constructor: Constructor<Box<dyn RequestHandler<R>>> =
            Box::new(move || -> Box<dyn RequestHandler<R>> { Box::new(constructor()) });
        self.sync
            .insert((TypeId::of::<H>(), TypeId::of::<R>()), Box::new(constructor));
        self
    }

    /// Register a constructor for async handler `H` of request `R`.
    pub fn register_async<R, H>(
        &mut self,
        constructor: impl Fn() -> H + Send + Sync + 'static,
    ) -> &mut Self
    where
        R: Request,
        H: AsyncRequestHandler<R> + 'static,
    {
        let constructor: Constructor<Box<dyn AsyncRequestHandler<R>>> =
            Box::new(move || -> Box<dyn AsyncRequestHandler<R>> { Box::new(constructor()) });
        self.asynchronous
            .insert((TypeId::of::<H>(), TypeId::of::<R>()), Box::new(constructor));
        self
    }

    /// Register `H::default` for blocking handler `H` of request `R`.
    pub fn register_default<R, H>(&mut self) -> &mut Self
    where
        R: Request,
        H: RequestHandler<R> + Default + 'static,
    {
        self.register::<R, H>(H::default)
    }

    /// Register `H::default` for async handler `H` of request `R`.
    pub fn register_default_async<R, H>(&mut self) -> &mut Self
    where
        R: Request,
        H: AsyncRequestHandler<R> + Default + 'static,
    {
        self.register_async::<R, H>(H::default)
    }
}

fn construct<R: Request, T: 'static>(
    table: &HashMap<Key, Box<dyn Any + Send + Sync>>,
    handler: &HandlerType,
) -> Result<T, HandlerFactoryError> {
    let constructor = table
        .get(&(handler.type_id(), TypeId::of::<R>()))
        .and_then(|boxed| boxed.downcast_ref::<Constructor<T>>());

    match constructor {
        Some(constructor) => Ok(constructor()),
        None if table.keys().any(|(id, _)| *id == handler.type_id()) => {
            Err(HandlerFactoryError::WrongRequestType {
                handler: handler.name().to_string(),
                request_type: std::any::type_name::<R>().to_string(),
            })
        }
        None => Err(HandlerFactoryError::NotRegistered(handler.name().to_string())),
    }
}

impl HandlerFactory for SimpleHandlerFactory {
    fn create<R: Request>(
        &self,
        handler: &HandlerType,
    ) -> Result<Box<dyn RequestHandler<R>>, HandlerFactoryError> {
        construct::<R, Box<dyn RequestHandler<R>>>(&self.sync, handler)
    }

    fn release<R: Request>(&self, handler: &HandlerType, instance: Box<dyn RequestHandler<R>>) {
        tracing::trace!(handler = handler.short_name(), "Releasing handler");
        drop(instance);
    }
}

impl AsyncHandlerFactory for SimpleHandlerFactory {
    fn create_async<R: Request>(
        &self,
        handler: &HandlerType,
    ) -> Result<Box<dyn AsyncRequestHandler<R>>, HandlerFactoryError> {
        construct::<R, Box<dyn AsyncRequestHandler<R>>>(&self.asynchronous, handler)
    }

    fn release_async<R: Request>(
        &self,
        handler: &HandlerType,
        instance: Box<dyn AsyncRequestHandler<R>>,
    ) {
        tracing::trace!(handler = handler.short_name(), "Releasing async handler");
        drop(instance);
    }
}

impl fmt::Debug for SimpleHandlerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleHandlerFactory")
            .field("sync", &self.sync.len())
            .field("async", &self.asynchronous.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::context::RequestContext;
    use courier_core::handler::HandlerError;
    use courier_core::request::{RequestId, RequestKind};

    struct Ping;
    impl Request for Ping {
        fn id(&self) -> RequestId {
            RequestId::new()
        }
        fn kind(&self) -> RequestKind {
            RequestKind::Command
        }
    }

    struct Pong;
    impl Request for Pong {
        fn id(&self) -> RequestId {
            RequestId::new()
        }
        fn kind(&self) -> RequestKind {
            RequestKind::Command
        }
    }

    #[derive(Default)]
    struct PingHandler;
    impl RequestHandler<Ping> for PingHandler {
        fn handle(&self, _: &Ping, context: &mut RequestContext) -> Result<(), HandlerError> {
            context.insert("ping", true);
            Ok(())
        }
    }

    struct Unknown;

    #[test]
    fn creates_registered_handlers() {
        let mut factory = SimpleHandlerFactory::new();
        factory.register_default::<Ping, PingHandler>();

        let created = factory.create::<Ping>(&HandlerType::of::<PingHandler>());
        let Ok(handler) = created else {
            unreachable!("handler should be registered");
        };
        let mut context = RequestContext::new();
        assert!(handler.handle(&Ping, &mut context).is_ok());
        assert!(context.contains_key("ping"));
        factory.release::<Ping>(&HandlerType::of::<PingHandler>(), handler);
    }

    #[test]
    fn reports_wrong_request_type() {
        let mut factory = SimpleHandlerFactory::new();
        factory.register_default::<Ping, PingHandler>();

        assert!(matches!(
            factory.create::<Pong>(&HandlerType::of::<PingHandler>()),
            Err(HandlerFactoryError::WrongRequestType { .. })
        ));
    }

    #[test]
    fn reports_unregistered_handlers() {
        let factory = SimpleHandlerFactory::new();

        assert!(matches!(
            factory.create::<Ping>(&HandlerType::of::<Unknown>()),
            Err(HandlerFactoryError::NotRegistered(_))
        ));
        assert!(matches!(
            factory.create_async::<Ping>(&HandlerType::of::<Unknown>()),
            Err(HandlerFactoryError::NotRegistered(_))
        ));
    }
}
