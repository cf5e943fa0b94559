//! Pipeline builder: turns registrations into ordered chains of handler instances.
//!
//! For one registration the chain is
//!
//! ```text
//! [before markers by ascending step] → terminal → [after markers by ascending step]
//! ```
//!
//! Steps that tie keep their declaration order. Foreign markers are skipped.
//!
//! Building happens in two phases. First every node of every requested chain is planned
//! and checked against the pipeline mode, so a misconfigured chain fails before the factory
//! is asked for anything. Then instances are created in chain order. A pipeline releases
//! its instances through the factory, in chain order, when it is dropped; that includes a
//! partially built pipeline whose construction failed.

use crate::registry::{PipelineMode, Registration, SubscriberRegistry};
use courier_core::context::RequestContext;
use courier_core::error::{ConfigurationError, DispatchError};
use courier_core::factory::{AsyncHandlerFactory, HandlerFactory};
use courier_core::handler::{
    AsyncRequestHandler, HandlerModality, HandlerTiming, HandlerType, RequestHandler,
};
use courier_core::observer::{DispatchEvent, DispatchObserver, NoopObserver};
use courier_core::request::Request;
use smallvec::SmallVec;
use std::fmt;

static NOOP: NoopObserver = NoopObserver;

/// Separator used by [`Pipeline::describe`].
pub const PATH_SEPARATOR: &str = " → ";

/// Handler types of one chain, in execution order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainPlan {
    handlers: SmallVec<[HandlerType; 4]>,
    terminal: HandlerType,
}

impl ChainPlan {
    /// Handler types in execution order.
    #[must_use]
    pub fn handlers(&self) -> &[HandlerType] {
        &self.handlers
    }

    /// The terminal handler.
    #[must_use]
    pub const fn terminal(&self) -> HandlerType {
        self.terminal
    }

    /// Chain as `A → B → C`.
    #[must_use]
    pub fn describe(&self) -> String {
        describe_chain(self.handlers.iter().map(HandlerType::short_name))
    }
}

/// Order the nodes of `registration` and check each against `mode`.
///
/// # Errors
///
/// Returns [`ConfigurationError::ModalityMismatch`] naming the first node that cannot run
/// in `mode`.
pub fn plan_chain(
    registration: &Registration,
    mode: PipelineMode,
    request_type: &'static str,
) -> Result<ChainPlan, ConfigurationError> {
    let mut before: SmallVec<[_; 4]> = SmallVec::new();
    let mut after: SmallVec<[_; 4]> = SmallVec::new();
    for descriptor in registration.descriptors() {
        match descriptor.timing {
            HandlerTiming::Before => before.push(descriptor),
            HandlerTiming::After => after.push(descriptor),
        }
    }
    // stable: ties keep declaration order
    before.sort_by_key(|descriptor| descriptor.step);
    after.sort_by_key(|descriptor| descriptor.step);

    let nodes = before
        .iter()
        .map(|d| (d.handler, d.modality))
        .chain(std::iter::once((registration.terminal(), registration.modality())))
        .chain(after.iter().map(|d| (d.handler, d.modality)));

    let mut handlers = SmallVec::new();
    for (handler, modality) in nodes {
        check_modality(handler, modality, mode, request_type)?;
        handlers.push(handler);
    }
    Ok(ChainPlan {
        handlers,
        terminal: registration.terminal(),
    })
}

fn check_modality(
    handler: HandlerType,
    modality: HandlerModality,
    mode: PipelineMode,
    request_type: &'static str,
) -> Result<(), ConfigurationError> {
    if mode.accepts(modality) {
        Ok(())
    } else {
        Err(ConfigurationError::ModalityMismatch {
            handler: handler.short_name().to_string(),
            pipeline: mode.describe(),
            request_type,
        })
    }
}

fn describe_chain(names: impl Iterator<Item = &'static str>) -> String {
    names.collect::<Vec<_>>().join(PATH_SEPARATOR)
}

/// Builds pipelines for requests from a registry and a handler factory.
///
/// The builder is generic over the factory; blocking builds need a [`HandlerFactory`],
/// async builds an [`AsyncHandlerFactory`].
pub struct PipelineBuilder<'a, F> {
    registry: &'a SubscriberRegistry,
    factory: &'a F,
    observer: &'a dyn DispatchObserver,
}

impl<'a, F> PipelineBuilder<'a, F> {
    /// Builder over `registry` and `factory`.
    #[must_use]
    pub fn new(registry: &'a SubscriberRegistry, factory: &'a F) -> Self {
        Self {
            registry,
            factory,
            observer: &NOOP,
        }
    }

    /// Report `PipelineBuilt` events to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: &'a dyn DispatchObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Plan the single command chain for `R`.
    fn plan_command<R: Request>(&self, mode: PipelineMode) -> Result<ChainPlan, DispatchError> {
        let request_type = std::any::type_name::<R>();
        match self.registry.get::<R>(mode) {
            [] => Err(DispatchError::NoHandlerFound { request_type }),
            [registration] => Ok(plan_chain(registration, mode, request_type)?),
            registrations => Err(DispatchError::AmbiguousHandler {
                request_type,
                count: registrations.len(),
            }),
        }
    }

    /// Plan one chain per registration for `R`.
    fn plan_all<R: Request>(&self, mode: PipelineMode) -> Result<Vec<ChainPlan>, DispatchError> {
        let request_type = std::any::type_name::<R>();
        self.registry
            .get::<R>(mode)
            .iter()
            .map(|registration| {
                plan_chain(registration, mode, request_type).map_err(DispatchError::from)
            })
            .collect()
    }

    fn built(&self, request_type: &'static str, path: String) {
        metrics::counter!("courier_pipeline_build_total", "outcome" => "success").increment(1);
        tracing::debug!(request_type, path = %path, "Pipeline built");
        self.observer.on_event(&DispatchEvent::PipelineBuilt { request_type, path });
    }

    fn failed(err: DispatchError) -> DispatchError {
        metrics::counter!("courier_pipeline_build_total", "outcome" => "failure").increment(1);
        tracing::debug!(error = %err, "Pipeline build failed");
        err
    }
}

/// Hand out one context per pipeline: the original for a single pipeline, copies otherwise.
fn contexts(context: RequestContext, count: usize) -> Vec<RequestContext> {
    let mut contexts: Vec<_> = (1..count).map(|_| context.create_copy()).collect();
    if count > 0 {
        contexts.push(context);
    }
    contexts
}

impl<'a, F: HandlerFactory> PipelineBuilder<'a, F> {
    /// Build the blocking pipeline for command `R`.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NoHandlerFound`] with no registration for `R`
    /// - [`DispatchError::AmbiguousHandler`] with more than one
    /// - [`DispatchError::Configuration`] on a modality mismatch or factory failure
    pub fn build<R: Request>(
        &self,
        context: RequestContext,
    ) -> Result<Pipeline<'a, R, F>, DispatchError> {
        let plan = self.plan_command::<R>(PipelineMode::Sync).map_err(Self::failed)?;
        self.instantiate(&plan, context).map_err(Self::failed)
    }

    /// Build one blocking pipeline per registered handler of event `R`.
    ///
    /// Returns an empty vector when nothing is registered. With several pipelines each
    /// receives its own copy of `context`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] on a modality mismatch or factory failure.
    pub fn build_all<R: Request>(
        &self,
        context: RequestContext,
    ) -> Result<Vec<Pipeline<'a, R, F>>, DispatchError> {
        let plans = self.plan_all::<R>(PipelineMode::Sync).map_err(Self::failed)?;
        let contexts = contexts(context, plans.len());
        plans
            .iter()
            .zip(contexts)
            .map(|(plan, context)| self.instantiate(plan, context).map_err(Self::failed))
            .collect()
    }

    fn instantiate<R: Request>(
        &self,
        plan: &ChainPlan,
        context: RequestContext,
    ) -> Result<Pipeline<'a, R, F>, DispatchError> {
        let mut pipeline = Pipeline {
            factory: self.factory,
            nodes: SmallVec::new(),
            terminal: plan.terminal,
            context,
        };
        for handler in &plan.handlers {
            // on error `pipeline` drops here and releases what was created
            let instance = self
                .factory
                .create::<R>(handler)
                .map_err(ConfigurationError::from)?;
            pipeline.nodes.push(Node {
                handler: *handler,
                instance: Some(instance),
            });
        }
        self.built(std::any::type_name::<R>(), pipeline.describe());
        Ok(pipeline)
    }
}

impl<'a, F: AsyncHandlerFactory> PipelineBuilder<'a, F> {
    /// Build the async pipeline for command `R`.
    ///
    /// # Errors
    ///
    /// Same as [`PipelineBuilder::build`].
    pub fn build_async<R: Request>(
        &self,
        context: RequestContext,
    ) -> Result<AsyncPipeline<'a, R, F>, DispatchError> {
        let plan = self.plan_command::<R>(PipelineMode::Async).map_err(Self::failed)?;
        self.instantiate_async(&plan, context).map_err(Self::failed)
    }

    /// Build one async pipeline per registered handler of event `R`.
    ///
    /// # Errors
    ///
    /// Same as [`PipelineBuilder::build_all`].
    pub fn build_all_async<R: Request>(
        &self,
        context: RequestContext,
    ) -> Result<Vec<AsyncPipeline<'a, R, F>>, DispatchError> {
        let plans = self.plan_all::<R>(PipelineMode::Async).map_err(Self::failed)?;
        let contexts = contexts(context, plans.len());
        plans
            .iter()
            .zip(contexts)
            .map(|(plan, context)| self.instantiate_async(plan, context).map_err(Self::failed))
            .collect()
    }

    fn instantiate_async<R: Request>(
        &self,
        plan: &ChainPlan,
        context: RequestContext,
    ) -> Result<AsyncPipeline<'a, R, F>, DispatchError> {
        let mut pipeline = AsyncPipeline {
            factory: self.factory,
            nodes: SmallVec::new(),
            terminal: plan.terminal,
            context: tokio::sync::Mutex::new(context),
        };
        for handler in &plan.handlers {
            let instance = self
                .factory
                .create_async::<R>(handler)
                .map_err(ConfigurationError::from)?;
            pipeline.nodes.push(AsyncNode {
                handler: *handler,
                instance: Some(instance),
            });
        }
        self.built(std::any::type_name::<R>(), pipeline.describe());
        Ok(pipeline)
    }
}

struct Node<R: Request> {
    handler: HandlerType,
    instance: Option<Box<dyn RequestHandler<R>>>,
}

/// A built blocking chain for one request.
pub struct Pipeline<'f, R: Request, F: HandlerFactory> {
    factory: &'f F,
    nodes: SmallVec<[Node<R>; 4]>,
    terminal: HandlerType,
    context: RequestContext,
}

impl<R: Request, F: HandlerFactory> Pipeline<'_, R, F> {
    /// Run the chain. Stops at the first failing node, or before the next node once the
    /// context is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Handler`] attributed to the failing node, or
    /// [`DispatchError::Cancelled`].
    pub fn handle(&mut self, request: &R) -> Result<(), DispatchError> {
        for node in &self.nodes {
            let Some(instance) = node.instance.as_deref() else {
                continue;
            };
            if self.context.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            tracing::trace!(handler = node.handler.short_name(), "Running handler");
            instance
                .handle(request, &mut self.context)
                .map_err(|err| err.with_handler(node.handler.short_name()))?;
        }
        Ok(())
    }

    /// Chain as `A → B → C`.
    #[must_use]
    pub fn describe(&self) -> String {
        describe_chain(self.nodes.iter().map(|node| node.handler.short_name()))
    }

    /// Handler types in execution order.
    #[must_use]
    pub fn handlers(&self) -> Vec<HandlerType> {
        self.nodes.iter().map(|node| node.handler).collect()
    }

    /// Terminal handler type.
    #[must_use]
    pub const fn terminal(&self) -> HandlerType {
        self.terminal
    }

    /// Context shared by every node.
    #[must_use]
    pub const fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Mutable access to the context.
    pub const fn context_mut(&mut self) -> &mut RequestContext {
        &mut self.context
    }
}

impl<R: Request, F: HandlerFactory> Drop for Pipeline<'_, R, F> {
    fn drop(&mut self) {
        for node in &mut self.nodes {
            if let Some(instance) = node.instance.take() {
                self.factory.release::<R>(&node.handler, instance);
            }
        }
    }
}

impl<R: Request, F: HandlerFactory> fmt::Debug for Pipeline<'_, R, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("path", &self.describe())
            .finish_non_exhaustive()
    }
}

struct AsyncNode<R: Request> {
    handler: HandlerType,
    instance: Option<Box<dyn AsyncRequestHandler<R>>>,
}

/// A built async chain for one request.
///
/// The context sits behind an async mutex so [`AsyncPipeline::handle`] can take `&self`,
/// which lets retry policies re-run the chain.
pub struct AsyncPipeline<'f, R: Request, F: AsyncHandlerFactory> {
    factory: &'f F,
    nodes: SmallVec<[AsyncNode<R>; 4]>,
    terminal: HandlerType,
    context: tokio::sync::Mutex<RequestContext>,
}

impl<R: Request, F: AsyncHandlerFactory> AsyncPipeline<'_, R, F> {
    /// Run the chain. Cancellation is observed between nodes and while a node is awaiting.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Handler`] attributed to the failing node, or
    /// [`DispatchError::Cancelled`].
    pub async fn handle(&self, request: &R) -> Result<(), DispatchError> {
        let mut context = self.context.lock().await;
        let token = context.cancellation().clone();

        for node in &self.nodes {
            let Some(instance) = node.instance.as_deref() else {
                continue;
            };
            if token.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            tracing::trace!(handler = node.handler.short_name(), "Running handler");
            tokio::select! {
                biased;
                () = token.cancelled() => return Err(DispatchError::Cancelled),
                result = instance.handle(request, &mut context) => {
                    result.map_err(|err| err.with_handler(node.handler.short_name()))?;
                }
            }
        }
        Ok(())
    }

    /// Chain as `A → B → C`.
    #[must_use]
    pub fn describe(&self) -> String {
        describe_chain(self.nodes.iter().map(|node| node.handler.short_name()))
    }

    /// Handler types in execution order.
    #[must_use]
    pub fn handlers(&self) -> Vec<HandlerType> {
        self.nodes.iter().map(|node| node.handler).collect()
    }

    /// Terminal handler type.
    #[must_use]
    pub const fn terminal(&self) -> HandlerType {
        self.terminal
    }

    /// Mutable access to the context.
    pub fn context_mut(&mut self) -> &mut RequestContext {
        self.context.get_mut()
    }
}

impl<R: Request, F: AsyncHandlerFactory> Drop for AsyncPipeline<'_, R, F> {
    fn drop(&mut self) {
        for node in &mut self.nodes {
            if let Some(instance) = node.instance.take() {
                self.factory.release_async::<R>(&node.handler, instance);
            }
        }
    }
}

impl<R: Request, F: AsyncHandlerFactory> fmt::Debug for AsyncPipeline<'_, R, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncPipeline")
            .field("path", &self.describe())
            .finish_non_exhaustive()
    }
}
