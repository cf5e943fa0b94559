//! Request ↔ message mapping.
//!
//! Reliable sends never hand a request to a producer directly. A [`MessageMapper`] turns
//! the request into a [`Message`] for the outbox, and back again on the receiving side.
//! Mappers are registered per request type in a [`MessageMapperRegistry`].

use crate::context::RequestContext;
use crate::message::{Message, MessageBody, MessageHeader, MessageId, MessageType};
use crate::publication::Publication;
use crate::request::Request;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while mapping between requests and messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapperError {
    /// No mapper is registered for the request type.
    #[error("No message mapper registered for {0}")]
    NotRegistered(String),

    /// No publication declares the request type.
    #[error("No publication found for request type {0}")]
    NoPublication(String),

    /// The request could not be written as a message body.
    #[error("Failed to serialize {request_type}: {reason}")]
    Serialization {
        /// Request type name.
        request_type: String,
        /// Underlying error.
        reason: String,
    },

    /// The message body could not be read back as a request.
    #[error("Failed to deserialize message {message_id}: {reason}")]
    Deserialization {
        /// Id of the offending message.
        message_id: MessageId,
        /// Underlying error.
        reason: String,
    },
}

/// Converts requests of type `R` to messages and back.
pub trait MessageMapper<R: Request>: Send + Sync {
    /// Build the outgoing message for `request` on `publication`.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Serialization`] when the body cannot be produced.
    fn map_to_message(
        &self,
        request: &R,
        publication: &Publication,
        context: &RequestContext,
    ) -> Result<Message, MapperError>;

    /// Rebuild the request carried by `message`.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::Deserialization`] when the body is not a valid `R`.
    fn map_to_request(&self, message: &Message) -> Result<R, MapperError>;
}

/// Header every mapper should start from: identity, routing and correlation metadata.
///
/// The message id is the request id, so re-mapping the same request yields the same
/// outbox key.
#[must_use]
pub fn header_for<R: Request>(
    request: &R,
    publication: &Publication,
    context: &RequestContext,
) -> MessageHeader {
    let mut header = MessageHeader::new(
        MessageId::from(request.id()),
        publication.topic().clone(),
        MessageType::from(request.kind()),
    )
    .with_type_name(request.request_type())
    .with_source(publication.source());

    if let Some(correlation_id) = context.correlation_id() {
        header = header.with_correlation_id(correlation_id);
    }
    if let Some(partition_key) = context.partition_key() {
        header = header.with_partition_key(partition_key);
    }
    if let Some(reply_to) = publication.reply_to() {
        header = header.with_reply_to(reply_to);
    }
    for (key, value) in publication.default_headers() {
        header = header.with_bag_entry(key.clone(), value.clone());
    }
    header
}

/// Mapper that writes the request as a JSON body.
pub struct JsonMessageMapper<R> {
    _request: PhantomData<fn() -> R>,
}

impl<R> JsonMessageMapper<R> {
    /// Create a JSON mapper.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _request: PhantomData,
        }
    }
}

impl<R> Default for JsonMessageMapper<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> MessageMapper<R> for JsonMessageMapper<R>
where
    R: Request + Serialize + DeserializeOwned,
{
    fn map_to_message(
        &self,
        request: &R,
        publication: &Publication,
        context: &RequestContext,
    ) -> Result<Message, MapperError> {
        let body = MessageBody::from_json(request).map_err(|e| MapperError::Serialization {
            request_type: request.request_type().to_string(),
            reason: e.to_string(),
        })?;
        let header =
            header_for(request, publication, context).with_content_type(body.content_type());
        Ok(Message::new(header, body))
    }

    fn map_to_request(&self, message: &Message) -> Result<R, MapperError> {
        serde_json::from_slice(message.body().bytes()).map_err(|e| MapperError::Deserialization {
            message_id: message.id(),
            reason: e.to_string(),
        })
    }
}

/// Mappers keyed by request type.
#[derive(Default)]
pub struct MessageMapperRegistry {
    mappers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl MessageMapperRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `mapper` for request type `R`, replacing any previous mapper.
    pub fn register<R, M>(&mut self, mapper: M) -> &mut Self
    where
        R: Request,
        M: MessageMapper<R> + 'static,
    {
        let mapper: Arc<dyn MessageMapper<R>> = Arc::new(mapper);
        self.mappers.insert(TypeId::of::<R>(), Box::new(mapper));
        self
    }

    /// Register a [`JsonMessageMapper`] for `R`.
    pub fn register_json<R>(&mut self) -> &mut Self
    where
        R: Request + Serialize + DeserializeOwned,
    {
        self.register::<R, _>(JsonMessageMapper::<R>::new())
    }

    /// Mapper for `R`, if one is registered.
    #[must_use]
    pub fn get<R: Request>(&self) -> Option<Arc<dyn MessageMapper<R>>> {
        self.mappers
            .get(&TypeId::of::<R>())
            .and_then(|boxed| boxed.downcast_ref::<Arc<dyn MessageMapper<R>>>())
            .cloned()
    }

    /// Mapper for `R`.
    ///
    /// # Errors
    ///
    /// Returns [`MapperError::NotRegistered`] when no mapper exists for `R`.
    pub fn require<R: Request>(&self) -> Result<Arc<dyn MessageMapper<R>>, MapperError> {
        self.get::<R>()
            .ok_or_else(|| MapperError::NotRegistered(std::any::type_name::<R>().to_string()))
    }

    /// Number of registered mappers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    /// Whether no mapper is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}

impl std::fmt::Debug for MessageMapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageMapperRegistry")
            .field("mappers", &self.mappers.len())
            .finish()
    }
}
