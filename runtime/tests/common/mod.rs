//! Shared fixtures for the runtime integration tests.

#![allow(dead_code)] // Not every test file uses every fixture

use courier_core::prelude::*;
use courier_runtime::factory::SimpleHandlerFactory;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MyCommand {
    pub id: RequestId,
    pub value: u32,
}

impl MyCommand {
    pub fn new(value: u32) -> Self {
        Self {
            id: RequestId::new(),
            value,
        }
    }
}

impl Request for MyCommand {
    fn id(&self) -> RequestId {
        self.id
    }
    fn kind(&self) -> RequestKind {
        RequestKind::Command
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MyEvent {
    pub id: RequestId,
}

impl MyEvent {
    pub fn new() -> Self {
        Self { id: RequestId::new() }
    }
}

impl Request for MyEvent {
    fn id(&self) -> RequestId {
        self.id
    }
    fn kind(&self) -> RequestKind {
        RequestKind::Event
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Execution trace shared by every handler of a test.
#[derive(Clone, Debug, Default)]
pub struct Trace(Arc<Mutex<Vec<&'static str>>>);

impl Trace {
    pub fn push(&self, entry: &'static str) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| **e == entry).count()
    }
}

/// Handler types that record their name and succeed, for any request, in both modalities.
macro_rules! tracing_handler {
    ($($name:ident),* $(,)?) => {$(
        #[derive(Clone, Debug)]
        pub struct $name {
            pub trace: Trace,
        }

        impl<R: Request> RequestHandler<R> for $name {
            fn handle(&self, _: &R, _: &mut RequestContext) -> Result<(), HandlerError> {
                self.trace.push(stringify!($name));
                Ok(())
            }
        }

        impl<R: Request> AsyncRequestHandler<R> for $name {
            fn handle<'a>(&'a self, _: &'a R, _: &'a mut RequestContext) -> HandlerFuture<'a> {
                Box::pin(async move {
                    tokio::task::yield_now().await;
                    self.trace.push(stringify!($name));
                    Ok(())
                })
            }
        }
    )*};
}

tracing_handler!(
    LoggingHandler,
    ValidationHandler,
    MyCommandHandler,
    AuditHandler,
    MetricsHandler,
    FirstSubscriber,
    SecondSubscriber,
    ThirdSubscriber,
);

/// Fails the first `failures` calls, then succeeds; `usize::MAX` fails forever.
#[derive(Clone, Debug)]
pub struct FlakyHandler {
    pub trace: Trace,
    pub remaining: Arc<AtomicUsize>,
}

impl FlakyHandler {
    fn attempt(&self) -> Result<(), HandlerError> {
        self.trace.push("FlakyHandler");
        let failed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failed {
            Err(HandlerError::new("flaky failure"))
        } else {
            Ok(())
        }
    }
}

impl<R: Request> RequestHandler<R> for FlakyHandler {
    fn handle(&self, _: &R, _: &mut RequestContext) -> Result<(), HandlerError> {
        self.attempt()
    }
}

impl<R: Request> AsyncRequestHandler<R> for FlakyHandler {
    fn handle<'a>(&'a self, _: &'a R, _: &'a mut RequestContext) -> HandlerFuture<'a> {
        Box::pin(async move { self.attempt() })
    }
}

/// Writes `validated = true` into the context bag.
#[derive(Clone, Debug)]
pub struct StashHandler;

impl<R: Request> RequestHandler<R> for StashHandler {
    fn handle(&self, _: &R, context: &mut RequestContext) -> Result<(), HandlerError> {
        context.insert("validated", true);
        Ok(())
    }
}

/// Records whether `validated` was in the bag when it ran.
#[derive(Clone, Debug)]
pub struct BagCheckHandler {
    pub trace: Trace,
}

impl<R: Request> RequestHandler<R> for BagCheckHandler {
    fn handle(&self, _: &R, context: &mut RequestContext) -> Result<(), HandlerError> {
        self.trace.push(if context.contains_key("validated") {
            "bag:present"
        } else {
            "bag:missing"
        });
        Ok(())
    }
}

/// Async handler that sleeps before recording itself.
#[derive(Clone, Debug)]
pub struct SlowHandler {
    pub trace: Trace,
    pub delay: Duration,
}

impl<R: Request> AsyncRequestHandler<R> for SlowHandler {
    fn handle<'a>(&'a self, _: &'a R, _: &'a mut RequestContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.trace.push("SlowHandler");
            Ok(())
        })
    }
}

// ============================================================================
// Factories
// ============================================================================

/// Register every tracing handler for `R`, blocking and async.
pub fn register_tracing<R: Request>(factory: &mut SimpleHandlerFactory, trace: &Trace) {
    macro_rules! both {
        ($($name:ident),*) => {$(
            let t = trace.clone();
            factory.register::<R, $name>(move || $name { trace: t.clone() });
            let t = trace.clone();
            factory.register_async::<R, $name>(move || $name { trace: t.clone() });
        )*};
    }
    both!(
        LoggingHandler,
        ValidationHandler,
        MyCommandHandler,
        AuditHandler,
        MetricsHandler,
        FirstSubscriber,
        SecondSubscriber,
        ThirdSubscriber
    );
}

/// Register a [`FlakyHandler`] for `R` that fails `failures` times across all instances.
pub fn register_flaky<R: Request>(
    factory: &mut SimpleHandlerFactory,
    trace: &Trace,
    failures: usize,
) {
    let remaining = Arc::new(AtomicUsize::new(failures));
    let (t, r) = (trace.clone(), Arc::clone(&remaining));
    factory.register::<R, FlakyHandler>(move || FlakyHandler {
        trace: t.clone(),
        remaining: Arc::clone(&r),
    });
    let (t, r) = (trace.clone(), remaining);
    factory.register_async::<R, FlakyHandler>(move || FlakyHandler {
        trace: t.clone(),
        remaining: Arc::clone(&r),
    });
}

/// Factory with tracing handlers for both test requests.
pub fn tracing_factory(trace: &Trace) -> SimpleHandlerFactory {
    let mut factory = SimpleHandlerFactory::new();
    register_tracing::<MyCommand>(&mut factory, trace);
    register_tracing::<MyEvent>(&mut factory, trace);
    factory
}
