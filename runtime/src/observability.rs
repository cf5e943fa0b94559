//! Tracing integration: dispatch spans and the tracing-backed observer.

use courier_core::context::RequestContext;
use courier_core::message::MessageId;
use courier_core::observer::{DispatchEvent, DispatchObserver, DispatchOperation, Outcome};
use tracing::Span;

/// Span named `$name`, parented to the context's span when it carries one and to the
/// current span otherwise.
macro_rules! child_span {
    ($context:expr, $name:literal, $($fields:tt)*) => {
        match $context.span() {
            Some(parent) => tracing::info_span!(parent: parent, $name, $($fields)*),
            None => tracing::info_span!($name, $($fields)*),
        }
    };
}

/// Span entered for one dispatch operation.
pub(crate) fn dispatch_span(
    context: &RequestContext,
    operation: DispatchOperation,
    request_type: &'static str,
) -> Span {
    match operation {
        DispatchOperation::Send => child_span!(context, "courier.send", request_type),
        DispatchOperation::Publish => child_span!(context, "courier.publish", request_type),
        DispatchOperation::Post => child_span!(context, "courier.post", request_type),
    }
}

/// Span entered while clearing one outbox message.
pub(crate) fn clear_span(context: &RequestContext, message_id: MessageId) -> Span {
    child_span!(context, "courier.clear", message_id = %message_id)
}

/// Writes every [`DispatchEvent`] as a structured `tracing` event.
///
/// Successes go to `debug`, skips to `info` and failures to `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DispatchObserver for TracingObserver {
    fn on_event(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::PipelineBuilt { request_type, path } => {
                tracing::debug!(event = event.name(), request_type, path = %path, "Pipeline built");
            }
            DispatchEvent::Dispatched {
                operation,
                request_type,
                handlers,
                outcome,
            } => log_outcome(
                event.name(),
                outcome,
                &format!("{operation} of {request_type} to {handlers} handler(s)"),
            ),
            DispatchEvent::Deposited {
                topic,
                message_id,
                outcome,
            }
            | DispatchEvent::ClearAttempted {
                topic,
                message_id,
                outcome,
            }
            | DispatchEvent::MarkedDispatched {
                topic,
                message_id,
                outcome,
            } => log_outcome(event.name(), outcome, &format!("message {message_id} on '{topic}'")),
            DispatchEvent::Swept {
                attempted,
                dispatched,
                failed,
            } => {
                if *failed > 0 {
                    tracing::warn!(
                        event = event.name(),
                        attempted,
                        dispatched,
                        failed,
                        "Outbox swept"
                    );
                } else {
                    tracing::debug!(
                        event = event.name(),
                        attempted,
                        dispatched,
                        failed,
                        "Outbox swept"
                    );
                }
            }
        }
    }
}

fn log_outcome(event: &'static str, outcome: &Outcome, subject: &str) {
    match outcome {
        Outcome::Success => tracing::debug!(event, subject, outcome = outcome.as_str()),
        Outcome::Skipped => tracing::info!(event, subject, outcome = outcome.as_str()),
        Outcome::Failure(reason) => {
            tracing::warn!(event, subject, outcome = outcome.as_str(), reason = %reason);
        }
    }
}
