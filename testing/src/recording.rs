//! Recording collaborators: a handler factory that logs lifetimes and an event observer.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use courier_core::factory::{AsyncHandlerFactory, HandlerFactory, HandlerFactoryError};
use courier_core::handler::{AsyncRequestHandler, HandlerType, RequestHandler};
use courier_core::observer::{DispatchEvent, DispatchObserver};
use courier_core::request::Request;
use courier_runtime::factory::SimpleHandlerFactory;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// A handler lifetime step seen by [`RecordingHandlerFactory`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FactoryEvent {
    /// An instance was created; short handler name.
    Created(&'static str),
    /// An instance was released; short handler name.
    Released(&'static str),
}

/// Shared view of a [`RecordingHandlerFactory`]'s log, usable after the factory has been
/// moved into a dispatcher.
#[derive(Clone, Debug, Default)]
pub struct FactoryLog {
    events: Arc<Mutex<Vec<FactoryEvent>>>,
}

impl FactoryLog {
    fn push(&self, event: FactoryEvent) {
        self.events.lock().unwrap().push(event);
    }

    /// Every step in order.
    #[must_use]
    pub fn events(&self) -> Vec<FactoryEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Names of created handlers, in creation order.
    #[must_use]
    pub fn created(&self) -> Vec<&'static str> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                FactoryEvent::Created(name) => Some(name),
                FactoryEvent::Released(_) => None,
            })
            .collect()
    }

    /// Names of released handlers, in release order.
    #[must_use]
    pub fn released(&self) -> Vec<&'static str> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                FactoryEvent::Released(name) => Some(name),
                FactoryEvent::Created(_) => None,
            })
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

/// Wraps a [`SimpleHandlerFactory`] and records every create and release.
///
/// Individual handler types can be made to fail construction, to exercise
/// partially built pipelines.
///
/// # Example
///
/// ```
/// use courier_testing::RecordingHandlerFactory;
/// use courier_runtime::factory::SimpleHandlerFactory;
///
/// let factory = RecordingHandlerFactory::new(SimpleHandlerFactory::new());
/// let log = factory.log();
/// assert!(log.events().is_empty());
/// ```
#[derive(Debug)]
pub struct RecordingHandlerFactory {
    inner: SimpleHandlerFactory,
    log: FactoryLog,
    failing: HashSet<HandlerType>,
}

impl RecordingHandlerFactory {
    /// Record around `inner`.
    #[must_use]
    pub fn new(inner: SimpleHandlerFactory) -> Self {
        Self {
            inner,
            log: FactoryLog::default(),
            failing: HashSet::new(),
        }
    }

    /// Make creation of `handler` fail with [`HandlerFactoryError::Construction`].
    #[must_use]
    pub fn failing_on(mut self, handler: HandlerType) -> Self {
        self.failing.insert(handler);
        self
    }

    /// Handle to the log.
    #[must_use]
    pub fn log(&self) -> FactoryLog {
        self.log.clone()
    }

    fn check(&self, handler: &HandlerType) -> Result<(), HandlerFactoryError> {
        if self.failing.contains(handler) {
            return Err(HandlerFactoryError::Construction {
                handler: handler.name().to_string(),
                reason: "scripted construction failure".to_string(),
            });
        }
        Ok(())
    }
}

impl HandlerFactory for RecordingHandlerFactory {
    fn create<R: Request>(
        &self,
        handler: &HandlerType,
    ) -> Result<Box<dyn RequestHandler<R>>, HandlerFactoryError> {
        self.check(handler)?;
        let instance = self.inner.create::<R>(handler)?;
        self.log.push(FactoryEvent::Created(handler.short_name()));
        Ok(instance)
    }

    fn release<R: Request>(&self, handler: &HandlerType, instance: Box<dyn RequestHandler<R>>) {
        self.log.push(FactoryEvent::Released(handler.short_name()));
        self.inner.release::<R>(handler, instance);
    }
}

impl AsyncHandlerFactory for RecordingHandlerFactory {
    fn create_async<R: Request>(
        &self,
        handler: &HandlerType,
    ) -> Result<Box<dyn AsyncRequestHandler<R>>, HandlerFactoryError> {
        self.check(handler)?;
        let instance = self.inner.create_async::<R>(handler)?;
        self.log.push(FactoryEvent::Created(handler.short_name()));
        Ok(instance)
    }

    fn release_async<R: Request>(
        &self,
        handler: &HandlerType,
        instance: Box<dyn AsyncRequestHandler<R>>,
    ) {
        self.log.push(FactoryEvent::Released(handler.short_name()));
        self.inner.release_async::<R>(handler, instance);
    }
}

/// Observer that keeps every event it receives.
#[derive(Clone, Debug, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<DispatchEvent>>>,
}

impl RecordingObserver {
    /// Create an empty observer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Event names in arrival order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(DispatchEvent::name).collect()
    }

    /// Number of events named `name`.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.names().into_iter().filter(|n| *n == name).count()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl DispatchObserver for RecordingObserver {
    fn on_event(&self, event: &DispatchEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
