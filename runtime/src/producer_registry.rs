//! Resolves the producer responsible for a message.
//!
//! Lookup is by exact topic first. When no producer publishes to the message's topic, the
//! registry falls back to the first producer, in registration order, whose publication
//! declares the message's request type.

use courier_core::message::{Message, RoutingKey};
use courier_core::producer::{MessageProducer, ProducerError};
use courier_core::publication::Publication;
use courier_core::request::Request;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

/// Producers keyed by topic.
#[derive(Clone, Default)]
pub struct ProducerRegistry {
    producers: Vec<Arc<dyn MessageProducer>>,
    by_topic: HashMap<RoutingKey, usize>,
}

impl ProducerRegistry {
    /// Registry over `producers`. When two producers share a topic the first one wins.
    #[must_use]
    pub fn new(producers: Vec<Arc<dyn MessageProducer>>) -> Self {
        let mut by_topic = HashMap::new();
        for (index, producer) in producers.iter().enumerate() {
            match by_topic.entry(producer.publication().topic().clone()) {
                Entry::Occupied(entry) => {
                    tracing::warn!(topic = %entry.key(), "Duplicate producer for topic ignored");
                }
                Entry::Vacant(entry) => {
                    entry.insert(index);
                }
            }
        }
        Self { producers, by_topic }
    }

    /// Producer publishing exactly to `topic`.
    #[must_use]
    pub fn lookup_by(&self, topic: &RoutingKey) -> Option<&Arc<dyn MessageProducer>> {
        self.by_topic.get(topic).and_then(|index| self.producers.get(*index))
    }

    /// First producer whose publication declares `request_type`.
    #[must_use]
    pub fn lookup_by_request_type(&self, request_type: &str) -> Option<&Arc<dyn MessageProducer>> {
        self.producers
            .iter()
            .find(|producer| producer.publication().request_type() == Some(request_type))
    }

    /// Producer for `message`: exact topic, else by the header's request type.
    ///
    /// # Errors
    ///
    /// Returns [`ProducerError::Unavailable`] when neither rule matches.
    pub fn resolve(&self, message: &Message) -> Result<&Arc<dyn MessageProducer>, ProducerError> {
        if let Some(producer) = self.lookup_by(message.topic()) {
            return Ok(producer);
        }
        message
            .header()
            .type_name()
            .and_then(|request_type| self.lookup_by_request_type(request_type))
            .ok_or_else(|| {
                ProducerError::Unavailable(format!(
                    "no producer for topic '{}' or request type {}",
                    message.topic(),
                    message.header().type_name().unwrap_or("<unknown>")
                ))
            })
    }

    /// Publication declaring request type `R`, used when mapping a request to a message.
    #[must_use]
    pub fn find_publication<R: Request>(&self) -> Option<&Publication> {
        self.lookup_by_request_type(std::any::type_name::<R>())
            .map(|producer| producer.publication())
    }

    /// All producers in registration order.
    #[must_use]
    pub fn producers(&self) -> &[Arc<dyn MessageProducer>] {
        &self.producers
    }

    /// Number of producers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.producers.len()
    }

    /// Whether no producer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

impl fmt::Debug for ProducerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.producers.iter().map(|p| p.publication().topic()))
            .finish()
    }
}
