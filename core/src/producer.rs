//! Message producer contract.
//!
//! A producer delivers messages to one topic of an external broker. The transport itself
//! (AMQP, Kafka, SQS, ...) is out of scope: the dispatcher only needs `send`, optionally
//! delayed and batched sends, and whether the broker confirms publication later.

use crate::message::{Message, MessageId, RoutingKey};
use crate::publication::Publication;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Future returned by producer operations.
pub type ProducerFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProducerError>> + Send + 'a>>;

/// Errors raised by producers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProducerError {
    /// The broker rejected or failed the send.
    #[error("Failed to send to topic '{topic}': {reason}")]
    SendFailed {
        /// Target topic.
        topic: RoutingKey,
        /// Reason reported by the transport.
        reason: String,
    },

    /// The producer cannot schedule delayed sends.
    #[error("Producer for topic '{0}' does not support delayed send")]
    DelayNotSupported(RoutingKey),

    /// No producer is available for the message.
    #[error("No producer available: {0}")]
    Unavailable(String),
}

/// Sends messages to one topic.
pub trait MessageProducer: Send + Sync {
    /// Publication this producer serves.
    fn publication(&self) -> &Publication;

    /// Send one message.
    ///
    /// # Errors
    ///
    /// Returns [`ProducerError::SendFailed`] when the broker does not accept the message.
    fn send<'a>(&'a self, message: &'a Message) -> ProducerFuture<'a, ()>;

    /// Send one message for delivery after `delay`.
    ///
    /// # Errors
    ///
    /// The default implementation returns [`ProducerError::DelayNotSupported`].
    fn send_with_delay<'a>(
        &'a self,
        message: &'a Message,
        delay: Duration,
    ) -> ProducerFuture<'a, ()> {
        let _ = (message, delay);
        let topic = self.publication().topic().clone();
        Box::pin(async move { Err(ProducerError::DelayNotSupported(topic)) })
    }

    /// Send several messages bound for this producer's topic.
    ///
    /// Returns the ids that were sent. The default sends one by one and stops at the first
    /// failure, returning that failure; messages sent before it stay sent.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProducerError`] raised by [`MessageProducer::send`].
    fn send_batch<'a>(&'a self, messages: &'a [Message]) -> ProducerFuture<'a, Vec<MessageId>> {
        Box::pin(async move {
            let mut sent = Vec::with_capacity(messages.len());
            for message in messages {
                self.send(message).await?;
                sent.push(message.id());
            }
            Ok(sent)
        })
    }

    /// Whether the broker confirms publication asynchronously.
    ///
    /// When `true`, a successful `send` does not mark the outbox entry dispatched; the
    /// producer's confirmation callback does.
    fn confirms_publication(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_failed_names_topic() {
        let err = ProducerError::SendFailed {
            topic: RoutingKey::new("orders"),
            reason: "broker down".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to send to topic 'orders': broker down");
    }
}
