//! # Courier Runtime
//!
//! Execution half of the Courier dispatcher.
//!
//! ## Components
//!
//! - **Subscriber registry** ([`registry`]): which handlers receive which request type,
//!   with their before/after decorators
//! - **Pipeline builder** ([`pipeline`]): ordered handler chains, created and released
//!   through a handler factory
//! - **Dispatcher** ([`dispatcher`]): `send`, `publish` and `post`, blocking and async
//! - **Outbox mediator** ([`outbox`]): deposit, clear, sweep and backpressure for
//!   reliable messaging, plus a timed [`sweeper`]
//! - **Resilience** ([`retry`], [`circuit_breaker`], [`policy`]): named policies wrapped
//!   around handler chains and producer sends
//! - **Observability** ([`observability`], [`metrics`]): tracing spans, a tracing-backed
//!   event observer and Prometheus metrics
//!
//! ## Example
//!
//! ```
//! use courier_runtime::prelude::*;
//! use courier_core::prelude::*;
//!
//! struct OrderPlaced(RequestId);
//! impl Request for OrderPlaced {
//!     fn id(&self) -> RequestId { self.0 }
//!     fn kind(&self) -> RequestKind { RequestKind::Event }
//! }
//!
//! #[derive(Default)]
//! struct Audit;
//! impl RequestHandler<OrderPlaced> for Audit {
//!     fn handle(&self, _: &OrderPlaced, _: &mut RequestContext) -> Result<(), HandlerError> {
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = SubscriberRegistry::new();
//! registry.register::<OrderPlaced, Audit>();
//! let mut factory = SimpleHandlerFactory::new();
//! factory.register_default::<OrderPlaced, Audit>();
//!
//! let dispatcher = Dispatcher::builder(registry, factory).build();
//! assert!(dispatcher.publish(&OrderPlaced(RequestId::new())).is_ok());
//! ```

use chrono::{DateTime, Utc};
use courier_core::environment::Clock;

/// Retry logic with exponential backoff
pub mod retry;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Named resilience policies
pub mod policy;

/// Prometheus metrics for observability
pub mod metrics;

pub mod dispatcher;
pub mod factory;
pub mod observability;
pub mod outbox;
pub mod pipeline;
pub mod producer_registry;
pub mod registry;
pub mod sweeper;

/// Wall-clock [`Clock`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Commonly used runtime types.
pub mod prelude {
    pub use crate::SystemClock;
    pub use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    pub use crate::dispatcher::{Dispatcher, DispatcherBuilder, DispatcherConfig, NoOutbox};
    pub use crate::factory::SimpleHandlerFactory;
    pub use crate::observability::TracingObserver;
    pub use crate::outbox::{
        ClearOutcome, OutboxConfig, OutboxProducerMediator, SweepOptions, SweepReport,
    };
    pub use crate::pipeline::{AsyncPipeline, Pipeline, PipelineBuilder};
    pub use crate::policy::{
        DEFAULT_HANDLER_POLICY, DEFAULT_OUTBOX_POLICY, PolicyFailure, PolicyRegistry,
        ResiliencePolicy,
    };
    pub use crate::producer_registry::ProducerRegistry;
    pub use crate::registry::{PipelineMode, SubscriberRegistry};
    pub use crate::retry::RetryPolicy;
    pub use crate::sweeper::TimedOutboxSweeper;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
