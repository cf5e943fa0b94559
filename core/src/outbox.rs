//! Outbox store contract.
//!
//! The outbox is a durable table of outgoing messages. A message is written to it in the
//! same transaction as the business change that produced it, and is delivered to the
//! broker afterwards. An entry's `dispatched_at` moves from empty to set exactly once and
//! is never cleared; entries leave the table only through an explicit delete.
//!
//! Concrete stores (SQL tables, document collections, ...) live outside this crate.
//!
//! # Transactions
//!
//! Each store names its own [`OutboxStore::Transaction`] type. Callers that want the
//! deposit to commit atomically with their own writes pass their open transaction to
//! [`OutboxStore::add`]; callers that pass `None` get a standalone write.

use crate::message::{Message, MessageId};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Future returned by outbox store operations.
pub type OutboxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, OutboxError>> + Send + 'a>>;

/// Errors raised by outbox stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// A message with this id already exists.
    ///
    /// Stores may report duplicates this way instead of returning `Ok(false)` from `add`;
    /// the mediator treats both the same.
    #[error("Message {0} already exists in the outbox")]
    DuplicateMessage(MessageId),

    /// No entry for this id.
    #[error("Message {0} not found in the outbox")]
    NotFound(MessageId),

    /// The ambient transaction failed or was already finished.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Storage backend failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// One row of the outbox.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboxEntry {
    /// The stored message.
    pub message: Message,
    /// When the message was deposited.
    pub deposited_at: DateTime<Utc>,
    /// When the message was handed to a producer, if it has been.
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// A freshly deposited entry.
    #[must_use]
    pub const fn new(message: Message, deposited_at: DateTime<Utc>) -> Self {
        Self {
            message,
            deposited_at,
            dispatched_at: None,
        }
    }

    /// Whether the entry has been dispatched.
    #[must_use]
    pub const fn is_dispatched(&self) -> bool {
        self.dispatched_at.is_some()
    }

    /// Record dispatch at `at`. Returns `false`, leaving the timestamp untouched, if the
    /// entry was already dispatched.
    pub fn mark_dispatched(&mut self, at: DateTime<Utc>) -> bool {
        if self.dispatched_at.is_some() {
            return false;
        }
        self.dispatched_at = Some(at);
        true
    }
}

/// Durable storage for outgoing messages.
///
/// Methods return boxed futures so the trait stays usable behind `Arc<dyn OutboxStore<..>>`.
pub trait OutboxStore: Send + Sync {
    /// Caller-owned transaction a deposit can join.
    type Transaction: Send;

    /// Add `message`, inside `transaction` when one is given.
    ///
    /// Returns `true` when a new entry was written and `false` when an entry with the same
    /// id already existed. Adding an existing id must never overwrite it.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] or [`OutboxError::Transaction`] on backend failure.
    fn add<'a>(
        &'a self,
        message: &'a Message,
        deposited_at: DateTime<Utc>,
        transaction: Option<&'a mut Self::Transaction>,
    ) -> OutboxFuture<'a, bool>;

    /// Fetch one entry.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] on backend failure.
    fn get(&self, id: MessageId) -> OutboxFuture<'_, Option<OutboxEntry>>;

    /// Set `dispatched_at` for `id` if it is still empty.
    ///
    /// Returns `true` when this call performed the transition, `false` when the entry was
    /// already dispatched.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] when there is no entry for `id`.
    fn mark_dispatched(&self, id: MessageId, at: DateTime<Utc>) -> OutboxFuture<'_, bool>;

    /// Up to `page_size` undispatched entries deposited at or before `older_than`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] on backend failure.
    fn outstanding_messages(
        &self,
        older_than: DateTime<Utc>,
        page_size: usize,
    ) -> OutboxFuture<'_, Vec<OutboxEntry>>;

    /// Number of undispatched entries.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] on backend failure.
    fn outstanding_count(&self) -> OutboxFuture<'_, usize>;

    /// Up to `page_size` entries dispatched at or after `since`, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] on backend failure.
    fn dispatched_messages(
        &self,
        since: DateTime<Utc>,
        page_size: usize,
    ) -> OutboxFuture<'_, Vec<OutboxEntry>>;

    /// Delete the given entries. Unknown ids are ignored. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] on backend failure.
    fn delete<'a>(&'a self, ids: &'a [MessageId]) -> OutboxFuture<'a, usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageBody, MessageHeader, MessageType};
    use chrono::TimeZone;

    fn message() -> Message {
        Message::new(
            MessageHeader::new(MessageId::new(), "orders".into(), MessageType::Event),
            MessageBody::new(Vec::new(), "application/json"),
        )
    }

    #[test]
    fn dispatched_at_is_set_once() {
        let first = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single();
        let second = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).single();
        let (Some(first), Some(second)) = (first, second) else {
            return;
        };

        let mut entry = OutboxEntry::new(message(), first);
        assert!(!entry.is_dispatched());

        assert!(entry.mark_dispatched(first));
        assert!(!entry.mark_dispatched(second));
        assert_eq!(entry.dispatched_at, Some(first));
    }

    #[test]
    fn error_display_names_the_message() {
        let id = MessageId::new();
        assert!(OutboxError::DuplicateMessage(id).to_string().contains(&id.to_string()));
        assert!(OutboxError::NotFound(id).to_string().contains("not found"));
    }
}
