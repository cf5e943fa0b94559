//! The dispatcher: `send`, `publish` and `post`.
//!
//! - **send** routes a command to its single handler chain.
//! - **publish** fans an event out to every registered chain. Zero receivers is a success;
//!   failures are collected and reported together after every chain has run.
//! - **post** maps a request to a message, deposits it in the outbox and clears it through
//!   the producer responsible for its topic.
//!
//! Pipelines are built before the resilience policy is entered, so configuration errors
//! (no handler, ambiguous handler, modality mismatch) are returned without being retried.
//! A retry re-runs the chain that was already built: the same handler instances, and the
//! same [`RequestContext`], including whatever the failed attempt wrote to its bag.
//! Every operation has a blocking and an async form. Blocking `post`-family calls drive the
//! async outbox on a private current-thread runtime and refuse to run inside a tokio runtime.
//!
//! # Example
//!
//! ```
//! use courier_runtime::dispatcher::Dispatcher;
//! use courier_runtime::factory::SimpleHandlerFactory;
//! use courier_runtime::registry::SubscriberRegistry;
//! use courier_core::prelude::*;
//!
//! struct Greet(RequestId);
//! impl Request for Greet {
//!     fn id(&self) -> RequestId { self.0 }
//!     fn kind(&self) -> RequestKind { RequestKind::Command }
//! }
//!
//! #[derive(Default)]
//! struct GreetHandler;
//! impl RequestHandler<Greet> for GreetHandler {
//!     fn handle(&self, _: &Greet, context: &mut RequestContext) -> Result<(), HandlerError> {
//!         context.insert("greeted", true);
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = SubscriberRegistry::new();
//! registry.register::<Greet, GreetHandler>();
//! let mut factory = SimpleHandlerFactory::new();
//! factory.register_default::<Greet, GreetHandler>();
//!
//! let dispatcher = Dispatcher::builder(registry, factory).build();
//! assert!(dispatcher.send(&Greet(RequestId::new())).is_ok());
//! ```

use crate::observability::{TracingObserver, dispatch_span};
use crate::outbox::{ClearOutcome, OutboxProducerMediator};
use crate::pipeline::PipelineBuilder;
use crate::policy::{DEFAULT_HANDLER_POLICY, PolicyFailure, PolicyRegistry, ResiliencePolicy};
use crate::registry::{PipelineMode, SubscriberRegistry};
use courier_core::context::RequestContext;
use courier_core::error::{AggregatedHandlerFailure, ConfigurationError, DispatchError};
use courier_core::factory::{AsyncHandlerFactory, HandlerFactory};
use courier_core::handler::{HandlerError, HandlerType};
use courier_core::message::{Message, MessageId};
use courier_core::observer::{DispatchEvent, DispatchObserver, DispatchOperation, Outcome};
use courier_core::outbox::{OutboxEntry, OutboxFuture, OutboxStore};
use courier_core::request::Request;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Dispatcher behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Name of the policy wrapped around handler chains.
    pub handler_policy: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handler_policy: DEFAULT_HANDLER_POLICY.to_string(),
        }
    }
}

impl DispatcherConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap handler chains in the named policy.
    #[must_use]
    pub fn with_handler_policy(mut self, policy: impl Into<String>) -> Self {
        self.handler_policy = policy.into();
        self
    }
}

/// Outbox type of a dispatcher built without an outbox.
///
/// Uninhabited: `post`-family operations on such a dispatcher return
/// [`ConfigurationError::MissingOutbox`].
#[derive(Debug, Clone, Copy)]
pub enum NoOutbox {}

impl OutboxStore for NoOutbox {
    type Transaction = ();

    fn add<'a>(
        &'a self,
        _message: &'a Message,
        _deposited_at: DateTime<Utc>,
        _transaction: Option<&'a mut ()>,
    ) -> OutboxFuture<'a, bool> {
        match *self {}
    }

    fn get(&self, _id: MessageId) -> OutboxFuture<'_, Option<OutboxEntry>> {
        match *self {}
    }

    fn mark_dispatched(&self, _id: MessageId, _at: DateTime<Utc>) -> OutboxFuture<'_, bool> {
        match *self {}
    }

    fn outstanding_messages(
        &self,
        _older_than: DateTime<Utc>,
        _page_size: usize,
    ) -> OutboxFuture<'_, Vec<OutboxEntry>> {
        match *self {}
    }

    fn outstanding_count(&self) -> OutboxFuture<'_, usize> {
        match *self {}
    }

    fn dispatched_messages(
        &self,
        _since: DateTime<Utc>,
        _page_size: usize,
    ) -> OutboxFuture<'_, Vec<OutboxEntry>> {
        match *self {}
    }

    fn delete<'a>(&'a self, _ids: &'a [MessageId]) -> OutboxFuture<'a, usize> {
        match *self {}
    }
}

/// Assembles a [`Dispatcher`].
pub struct DispatcherBuilder<F, A, S: OutboxStore> {
    registry: SubscriberRegistry,
    factory: Arc<F>,
    async_factory: Arc<A>,
    policies: PolicyRegistry,
    outbox: Option<Arc<OutboxProducerMediator<S>>>,
    observer: Arc<dyn DispatchObserver>,
    config: DispatcherConfig,
}

impl<F, A, S: OutboxStore> DispatcherBuilder<F, A, S> {
    /// Create async handlers with `factory` instead of the blocking one.
    #[must_use]
    pub fn with_async_factory<A2>(self, factory: A2) -> DispatcherBuilder<F, A2, S> {
        DispatcherBuilder {
            registry: self.registry,
            factory: self.factory,
            async_factory: Arc::new(factory),
            policies: self.policies,
            outbox: self.outbox,
            observer: self.observer,
            config: self.config,
        }
    }

    /// Enable `post` through `mediator`.
    #[must_use]
    pub fn with_outbox<S2: OutboxStore>(
        self,
        mediator: Arc<OutboxProducerMediator<S2>>,
    ) -> DispatcherBuilder<F, A, S2> {
        DispatcherBuilder {
            registry: self.registry,
            factory: self.factory,
            async_factory: self.async_factory,
            policies: self.policies,
            outbox: Some(mediator),
            observer: self.observer,
            config: self.config,
        }
    }

    /// Resolve handler policies from `policies`.
    #[must_use]
    pub fn with_policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    /// Report events to `observer` instead of [`TracingObserver`].
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Use `config`.
    #[must_use]
    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish.
    #[must_use]
    pub fn build(self) -> Dispatcher<F, A, S> {
        Dispatcher {
            registry: self.registry,
            factory: self.factory,
            async_factory: self.async_factory,
            policies: self.policies,
            outbox: self.outbox,
            observer: self.observer,
            config: self.config,
        }
    }
}

/// Routes requests to handler pipelines and messages to producers.
pub struct Dispatcher<F, A = F, S: OutboxStore = NoOutbox> {
    registry: SubscriberRegistry,
    factory: Arc<F>,
    async_factory: Arc<A>,
    policies: PolicyRegistry,
    outbox: Option<Arc<OutboxProducerMediator<S>>>,
    observer: Arc<dyn DispatchObserver>,
    config: DispatcherConfig,
}

impl<F> Dispatcher<F, F, NoOutbox> {
    /// Start building a dispatcher over `registry`.
    ///
    /// `factory` creates both blocking and async handlers until
    /// [`DispatcherBuilder::with_async_factory`] says otherwise.
    #[must_use]
    pub fn builder(registry: SubscriberRegistry, factory: F) -> DispatcherBuilder<F, F, NoOutbox> {
        let factory = Arc::new(factory);
        DispatcherBuilder {
            registry,
            async_factory: Arc::clone(&factory),
            factory,
            policies: PolicyRegistry::with_defaults(),
            outbox: None,
            observer: Arc::new(TracingObserver),
            config: DispatcherConfig::default(),
        }
    }
}

impl<F, A, S: OutboxStore> Dispatcher<F, A, S> {
    /// The subscriber registry.
    #[must_use]
    pub const fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// The outbox mediator, when configured.
    #[must_use]
    pub fn outbox(&self) -> Option<&Arc<OutboxProducerMediator<S>>> {
        self.outbox.as_ref()
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn handler_policy(&self) -> Result<Arc<ResiliencePolicy>, DispatchError> {
        Ok(self
            .policies
            .get(&self.config.handler_policy)
            .map_err(ConfigurationError::from)?)
    }

    fn mediator(
        &self,
        operation: &'static str,
    ) -> Result<&OutboxProducerMediator<S>, DispatchError> {
        self.outbox
            .as_deref()
            .ok_or(DispatchError::Configuration(ConfigurationError::MissingOutbox(operation)))
    }

    /// Translate a failed policy execution around the chain ending in `terminal`.
    fn chain_failure(
        &self,
        failure: PolicyFailure<DispatchError>,
        terminal: HandlerType,
    ) -> DispatchError {
        match failure {
            PolicyFailure::Inner(err) => err,
            PolicyFailure::BrokenCircuit => DispatchError::BrokenCircuit {
                policy: self.config.handler_policy.clone(),
            },
            PolicyFailure::TimedOut(after) => {
                HandlerError::timeout(terminal.short_name(), after).into()
            }
        }
    }

    fn dispatched<T>(
        &self,
        operation: DispatchOperation,
        request_type: &'static str,
        handlers: usize,
        result: &Result<T, DispatchError>,
    ) {
        let outcome = match result {
            Ok(_) => Outcome::Success,
            Err(err) => Outcome::Failure(err.to_string()),
        };
        metrics::counter!(
            "courier_dispatch_total",
            "operation" => operation.as_str(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        if let Err(err) = result {
            tracing::debug!(%operation, request_type, error = %err, "Dispatch failed");
        }
        self.observer.on_event(&DispatchEvent::Dispatched {
            operation,
            request_type,
            handlers,
            outcome,
        });
    }
}

/// Only failures that could go away are retried.
fn retryable(err: &DispatchError) -> bool {
    err.is_transient()
}

fn request_type<R: Request>() -> &'static str {
    std::any::type_name::<R>()
}

/// Collapse per-chain results of a publish.
fn aggregate(
    request_type: &'static str,
    handlers: usize,
    failures: Vec<DispatchError>,
) -> Result<(), DispatchError> {
    if failures.is_empty() {
        return Ok(());
    }
    if failures.iter().any(|err| matches!(err, DispatchError::Cancelled)) {
        return Err(DispatchError::Cancelled);
    }
    Err(AggregatedHandlerFailure::new(request_type, handlers, failures).into())
}

impl<F: HandlerFactory, A, S: OutboxStore> Dispatcher<F, A, S> {
    /// Send command `request` to its handler.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NoHandlerFound`] / [`DispatchError::AmbiguousHandler`] unless
    ///   exactly one handler is registered
    /// - [`DispatchError::Configuration`] on a modality mismatch or factory failure
    /// - [`DispatchError::Handler`] once the handler policy gives up
    /// - [`DispatchError::BrokenCircuit`] when the policy's breaker is open
    pub fn send<R: Request>(&self, request: &R) -> Result<(), DispatchError> {
        self.send_with_context(request, RequestContext::new())
    }

    /// [`Dispatcher::send`], stopping between nodes once `token` is cancelled.
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::send`], plus [`DispatchError::Cancelled`].
    pub fn send_with_cancellation<R: Request>(
        &self,
        request: &R,
        token: &CancellationToken,
    ) -> Result<(), DispatchError> {
        self.send_with_context(request, RequestContext::new().with_cancellation(token.clone()))
    }

    /// [`Dispatcher::send`] with a caller-supplied context.
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::send_with_cancellation`].
    pub fn send_with_context<R: Request>(
        &self,
        request: &R,
        context: RequestContext,
    ) -> Result<(), DispatchError> {
        let request_type = request_type::<R>();
        let span = dispatch_span(&context, DispatchOperation::Send, request_type);
        let _entered = span.enter();

        let result = self.run_send(request, context);
        self.dispatched(
            DispatchOperation::Send,
            request_type,
            usize::from(result.is_ok()),
            &result,
        );
        result
    }

    fn run_send<R: Request>(
        &self,
        request: &R,
        context: RequestContext,
    ) -> Result<(), DispatchError> {
        let mut pipeline = PipelineBuilder::new(&self.registry, self.factory.as_ref())
            .with_observer(self.observer.as_ref())
            .build::<R>(context)?;
        let policy = self.handler_policy()?;
        let terminal = pipeline.terminal();

        policy
            .execute(|| pipeline.handle(request), retryable)
            .map_err(|failure| self.chain_failure(failure, terminal))
    }

    /// Publish event `request` to every registered handler, one after another.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Configuration`] when any chain fails to build; no handler runs
    /// - [`DispatchError::AggregatedHandlerFailure`] holding one error per failed chain
    /// - [`DispatchError::Cancelled`] when cancellation stopped a chain
    pub fn publish<R: Request>(&self, request: &R) -> Result<(), DispatchError> {
        self.publish_with_context(request, RequestContext::new())
    }

    /// [`Dispatcher::publish`], stopping chains once `token` is cancelled.
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::publish`].
    pub fn publish_with_cancellation<R: Request>(
        &self,
        request: &R,
        token: &CancellationToken,
    ) -> Result<(), DispatchError> {
        self.publish_with_context(request, RequestContext::new().with_cancellation(token.clone()))
    }

    /// [`Dispatcher::publish`] with a caller-supplied context; each chain gets its own copy
    /// when there is more than one.
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::publish`].
    pub fn publish_with_context<R: Request>(
        &self,
        request: &R,
        context: RequestContext,
    ) -> Result<(), DispatchError> {
        let request_type = request_type::<R>();
        let span = dispatch_span(&context, DispatchOperation::Publish, request_type);
        let _entered = span.enter();

        let handlers = self.registry.handler_count::<R>(PipelineMode::Sync);
        let result = self.run_publish(request, context);
        self.dispatched(DispatchOperation::Publish, request_type, handlers, &result);
        result
    }

    fn run_publish<R: Request>(
        &self,
        request: &R,
        context: RequestContext,
    ) -> Result<(), DispatchError> {
        let pipelines = PipelineBuilder::new(&self.registry, self.factory.as_ref())
            .with_observer(self.observer.as_ref())
            .build_all::<R>(context)?;
        if pipelines.is_empty() {
            tracing::debug!(request_type = request_type::<R>(), "No subscribers for event");
            return Ok(());
        }
        let policy = self.handler_policy()?;

        let handlers = pipelines.len();
        let mut failures = Vec::new();
        for mut pipeline in pipelines {
            let terminal = pipeline.terminal();
            if let Err(failure) = policy.execute(|| pipeline.handle(request), retryable) {
                failures.push(self.chain_failure(failure, terminal));
            }
        }
        aggregate(request_type::<R>(), handlers, failures)
    }
}

impl<F, A: AsyncHandlerFactory, S: OutboxStore> Dispatcher<F, A, S> {
    /// Async [`Dispatcher::send`].
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::send`]; a policy timeout surfaces as a timed-out
    /// [`DispatchError::Handler`].
    pub async fn send_async<R: Request>(&self, request: &R) -> Result<(), DispatchError> {
        self.send_async_with_context(request, RequestContext::new()).await
    }

    /// Async [`Dispatcher::send_with_cancellation`]; cancellation also interrupts a node that
    /// is awaiting.
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::send_async`], plus [`DispatchError::Cancelled`].
    pub async fn send_async_with_cancellation<R: Request>(
        &self,
        request: &R,
        token: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let context = RequestContext::new().with_cancellation(token.clone());
        self.send_async_with_context(request, context).await
    }

    /// Async [`Dispatcher::send_with_context`].
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::send_async_with_cancellation`].
    pub async fn send_async_with_context<R: Request>(
        &self,
        request: &R,
        context: RequestContext,
    ) -> Result<(), DispatchError> {
        let request_type = request_type::<R>();
        let span = dispatch_span(&context, DispatchOperation::Send, request_type);

        let result = self.run_send_async(request, context).instrument(span).await;
        self.dispatched(
            DispatchOperation::Send,
            request_type,
            usize::from(result.is_ok()),
            &result,
        );
        result
    }

    async fn run_send_async<R: Request>(
        &self,
        request: &R,
        context: RequestContext,
    ) -> Result<(), DispatchError> {
        let pipeline = PipelineBuilder::new(&self.registry, self.async_factory.as_ref())
            .with_observer(self.observer.as_ref())
            .build_async::<R>(context)?;
        let policy = self.handler_policy()?;
        let pipeline = &pipeline;

        policy
            .execute_async(move || pipeline.handle(request), retryable)
            .await
            .map_err(|failure| self.chain_failure(failure, pipeline.terminal()))
    }

    /// Async [`Dispatcher::publish`]. Chains run concurrently and every chain finishes
    /// before failures are reported.
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::publish`].
    pub async fn publish_async<R: Request>(&self, request: &R) -> Result<(), DispatchError> {
        self.publish_async_with_context(request, RequestContext::new()).await
    }

    /// Async [`Dispatcher::publish_with_cancellation`].
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::publish`].
    pub async fn publish_async_with_cancellation<R: Request>(
        &self,
        request: &R,
        token: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let context = RequestContext::new().with_cancellation(token.clone());
        self.publish_async_with_context(request, context).await
    }

    /// Async [`Dispatcher::publish_with_context`].
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::publish`].
    pub async fn publish_async_with_context<R: Request>(
        &self,
        request: &R,
        context: RequestContext,
    ) -> Result<(), DispatchError> {
        let request_type = request_type::<R>();
        let span = dispatch_span(&context, DispatchOperation::Publish, request_type);

        let handlers = self.registry.handler_count::<R>(PipelineMode::Async);
        let result = self.run_publish_async(request, context).instrument(span).await;
        self.dispatched(DispatchOperation::Publish, request_type, handlers, &result);
        result
    }

    async fn run_publish_async<R: Request>(
        &self,
        request: &R,
        context: RequestContext,
    ) -> Result<(), DispatchError> {
        let pipelines = PipelineBuilder::new(&self.registry, self.async_factory.as_ref())
            .with_observer(self.observer.as_ref())
            .build_all_async::<R>(context)?;
        if pipelines.is_empty() {
            tracing::debug!(request_type = request_type::<R>(), "No subscribers for event");
            return Ok(());
        }
        let policy = self.handler_policy()?;
        let policy = policy.as_ref();

        let runs = pipelines.iter().map(|pipeline| async move {
            policy
                .execute_async(move || pipeline.handle(request), retryable)
                .await
                .map_err(|failure| self.chain_failure(failure, pipeline.terminal()))
        });
        let failures = futures::future::join_all(runs)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        aggregate(request_type::<R>(), pipelines.len(), failures)
    }
}

impl<F, A, S: OutboxStore> Dispatcher<F, A, S> {
    /// Reliably send `request` through the outbox: map, deposit, then clear.
    ///
    /// A message that deposits but fails to clear stays in the outbox for the sweeper.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Configuration`] without an outbox, or when called inside a tokio
    ///   runtime (use [`Dispatcher::post_async`] there)
    /// - [`DispatchError::Mapping`], [`DispatchError::OutboxFull`], [`DispatchError::Outbox`]
    ///   from the deposit
    /// - [`DispatchError::Delivery`] / [`DispatchError::BrokenCircuit`] once the outbox policy
    ///   gives up
    pub fn post<R: Request>(&self, request: &R) -> Result<(), DispatchError> {
        block_on("post", self.post_async(request))
    }

    /// Async [`Dispatcher::post`].
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::post`], except for the runtime check.
    pub async fn post_async<R: Request>(&self, request: &R) -> Result<(), DispatchError> {
        self.post_async_with_context(request, RequestContext::new(), None).await
    }

    /// [`Dispatcher::post_async`], giving up before the deposit or the clear once `token` is
    /// cancelled.
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::post_async`], plus [`DispatchError::Cancelled`].
    pub async fn post_async_with_cancellation<R: Request>(
        &self,
        request: &R,
        token: &CancellationToken,
    ) -> Result<(), DispatchError> {
        let context = RequestContext::new().with_cancellation(token.clone());
        self.post_async_with_context(request, context, None).await
    }

    /// [`Dispatcher::post_async`] delivered after `delay`, for producers that support
    /// delayed sends.
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::post_async`]; a producer without delay support fails with
    /// [`courier_core::producer::ProducerError::DelayNotSupported`] and is not retried.
    pub async fn post_with_delay_async<R: Request>(
        &self,
        request: &R,
        delay: Duration,
    ) -> Result<(), DispatchError> {
        self.post_async_with_context(request, RequestContext::new(), Some(delay))
            .await
    }

    /// Post with a caller-supplied context and an optional delivery delay.
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::post_async_with_cancellation`].
    pub async fn post_async_with_context<R: Request>(
        &self,
        request: &R,
        context: RequestContext,
        delay: Option<Duration>,
    ) -> Result<(), DispatchError> {
        let request_type = request_type::<R>();
        let span = dispatch_span(&context, DispatchOperation::Post, request_type);

        let result = self.run_post(request, &context, delay).instrument(span).await;
        self.dispatched(
            DispatchOperation::Post,
            request_type,
            usize::from(result.is_ok()),
            &result,
        );
        result
    }

    async fn run_post<R: Request>(
        &self,
        request: &R,
        context: &RequestContext,
        delay: Option<Duration>,
    ) -> Result<(), DispatchError> {
        let outbox = self.mediator("post")?;
        let mut message = outbox.create_message(request, context)?;
        if let Some(delay) = delay {
            message = message.with_delay_ms(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        }

        if context.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        outbox.deposit(&message, None).await?;

        if context.is_cancelled() {
            // deposited; the sweeper will deliver it
            return Err(DispatchError::Cancelled);
        }
        outbox.clear_one(message.id(), context).await?;
        Ok(())
    }

    /// Map `request` and write it to the outbox inside `transaction`, without sending.
    ///
    /// Returns the message id to pass to [`Dispatcher::clear_outbox`] once the transaction
    /// has committed.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Configuration`] without an outbox, or inside a tokio runtime
    /// - [`DispatchError::Mapping`], [`DispatchError::OutboxFull`], [`DispatchError::Outbox`]
    pub fn deposit_post<R: Request>(
        &self,
        request: &R,
        transaction: Option<&mut S::Transaction>,
    ) -> Result<MessageId, DispatchError> {
        block_on("deposit_post", self.deposit_post_async(request, transaction))
    }

    /// Async [`Dispatcher::deposit_post`].
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::deposit_post`], except for the runtime check.
    pub async fn deposit_post_async<R: Request>(
        &self,
        request: &R,
        transaction: Option<&mut S::Transaction>,
    ) -> Result<MessageId, DispatchError> {
        let outbox = self.mediator("deposit_post")?;
        let message = outbox.create_message(request, &RequestContext::new())?;
        outbox.deposit(&message, transaction).await?;
        Ok(message.id())
    }

    /// Map every request and write all of them inside one `transaction`.
    ///
    /// Returns the message ids in request order.
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::deposit_post`]; a mapping failure aborts before anything is written.
    pub async fn deposit_post_batch_async<R: Request>(
        &self,
        requests: &[R],
        transaction: Option<&mut S::Transaction>,
    ) -> Result<Vec<MessageId>, DispatchError> {
        let outbox = self.mediator("deposit_post_batch")?;
        let context = RequestContext::new();
        let messages = requests
            .iter()
            .map(|request| outbox.create_message(request, &context))
            .collect::<Result<Vec<_>, _>>()?;
        outbox.deposit_batch(&messages, transaction).await?;
        Ok(messages.iter().map(Message::id).collect())
    }

    /// Send previously deposited messages.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Configuration`] without an outbox, or inside a tokio runtime
    /// - the first failure reported by [`OutboxProducerMediator::clear`]
    pub fn clear_outbox(&self, ids: &[MessageId]) -> Result<Vec<ClearOutcome>, DispatchError> {
        block_on("clear_outbox", self.clear_outbox_async(ids))
    }

    /// Async [`Dispatcher::clear_outbox`].
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::clear_outbox`], except for the runtime check.
    pub async fn clear_outbox_async(
        &self,
        ids: &[MessageId],
    ) -> Result<Vec<ClearOutcome>, DispatchError> {
        let outbox = self.mediator("clear_outbox")?;
        outbox.clear(ids, &RequestContext::new()).await
    }
}

impl<F, A, S: OutboxStore> std::fmt::Debug for Dispatcher<F, A, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("outbox", &self.outbox.is_some())
            .finish_non_exhaustive()
    }
}

static BLOCKING_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Drive `future` to completion on the private blocking runtime.
fn block_on<T>(
    operation: &'static str,
    future: impl Future<Output = Result<T, DispatchError>>,
) -> Result<T, DispatchError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(ConfigurationError::BlockingInAsyncContext(operation).into());
    }
    blocking_runtime()?.block_on(future)
}

fn blocking_runtime() -> Result<&'static Runtime, DispatchError> {
    if let Some(runtime) = BLOCKING_RUNTIME.get() {
        return Ok(runtime);
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            ConfigurationError::Other(format!("failed to start blocking runtime: {err}"))
        })?;
    Ok(BLOCKING_RUNTIME.get_or_init(|| runtime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::SimpleHandlerFactory;
    use courier_core::handler::RequestHandler;
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

    #[derive(Default)]
    struct PingHandler;
    impl RequestHandler<Ping> for PingHandler {
        fn handle(&self, _: &Ping, _: &mut RequestContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn dispatcher() -> Dispatcher<SimpleHandlerFactory> {
        let mut registry = SubscriberRegistry::new();
        registry.register::<Ping, PingHandler>();
        let mut factory = SimpleHandlerFactory::new();
        factory.register_default::<Ping, PingHandler>();
        Dispatcher::builder(registry, factory).build()
    }

    #[test]
    fn post_without_outbox_is_a_configuration_error() {
        let result = dispatcher().post(&Ping);
        assert!(matches!(
            result,
            Err(DispatchError::Configuration(ConfigurationError::MissingOutbox("post")))
        ));
    }

    #[tokio::test]
    async fn blocking_post_inside_a_runtime_is_refused() {
        let result = dispatcher().clear_outbox(&[MessageId::new()]);
        assert!(matches!(
            result,
            Err(DispatchError::Configuration(
                ConfigurationError::BlockingInAsyncContext("clear_outbox")
            ))
        ));
    }

    #[test]
    fn unknown_handler_policy_is_a_configuration_error() {
        let mut registry = SubscriberRegistry::new();
        registry.register::<Ping, PingHandler>();
        let mut factory = SimpleHandlerFactory::new();
        factory.register_default::<Ping, PingHandler>();
        let dispatcher = Dispatcher::builder(registry, factory)
            .with_config(DispatcherConfig::new().with_handler_policy("missing"))
            .build();

        let result = dispatcher.send(&Ping);
        assert!(result.as_ref().is_err_and(DispatchError::is_configuration));
    }

    #[test]
    fn publish_without_subscribers_succeeds() {
        struct Unheard;
        impl Request for Unheard {
            fn id(&self) -> RequestId {
                RequestId::new()
            }
            fn kind(&self) -> RequestKind {
                RequestKind::Event
            }
        }

        assert!(dispatcher().publish(&Unheard).is_ok());
    }
}
