//! In-memory outbox with staged transactions.
//!
//! [`InMemoryOutbox`] keeps entries in deposit order behind a lock. Deposits made inside an
//! [`InMemoryTransaction`] stay invisible until [`InMemoryOutbox::commit`]; a rollback (or
//! simply dropping the transaction) discards them.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use chrono::{DateTime, Utc};
use courier_core::message::{Message, MessageId};
use courier_core::outbox::{OutboxEntry, OutboxError, OutboxFuture, OutboxStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Deposits staged by a caller's unit of work.
#[derive(Debug, Default)]
pub struct InMemoryTransaction {
    staged: Vec<OutboxEntry>,
}

impl InMemoryTransaction {
    /// Number of staged deposits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    /// Whether nothing is staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Discard every staged deposit.
    pub fn rollback(self) {
        tracing::debug!(staged = self.staged.len(), "Transaction rolled back");
    }

    fn contains(&self, id: MessageId) -> bool {
        self.staged.iter().any(|entry| entry.message.id() == id)
    }
}

/// In-memory outbox for fast, deterministic tests.
///
/// # Example
///
/// ```
/// use courier_testing::InMemoryOutbox;
/// use courier_core::outbox::OutboxStore;
/// # use courier_core::message::*;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let outbox = InMemoryOutbox::new();
/// # let message = Message::new(
/// #     MessageHeader::new(MessageId::new(), "orders".into(), MessageType::Event),
/// #     MessageBody::new(Vec::new(), "application/json"),
/// # );
///
/// let mut transaction = outbox.begin();
/// outbox.add(&message, chrono::Utc::now(), Some(&mut transaction)).await?;
/// assert_eq!(outbox.outstanding_count().await?, 0);
///
/// outbox.commit(transaction)?;
/// assert_eq!(outbox.outstanding_count().await?, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryOutbox {
    entries: Arc<RwLock<Vec<OutboxEntry>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryOutbox {
    /// Create an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction.
    #[must_use]
    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction::default()
    }

    /// Make staged deposits visible. Returns how many were added; duplicates are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Transaction`] while the outbox is unavailable.
    pub fn commit(&self, transaction: InMemoryTransaction) -> Result<usize, OutboxError> {
        if self.is_unavailable() {
            return Err(OutboxError::Transaction("outbox unavailable".to_string()));
        }
        let mut entries = self.entries.write().unwrap();
        let mut added = 0;
        for entry in transaction.staged {
            if !entries.iter().any(|existing| existing.message.id() == entry.message.id()) {
                entries.push(entry);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Make every operation fail with a storage error until called with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), OutboxError> {
        if self.is_unavailable() {
            Err(OutboxError::Storage("outbox unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    /// Snapshot of the entry for `id`.
    #[must_use]
    pub fn entry(&self, id: MessageId) -> Option<OutboxEntry> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .find(|entry| entry.message.id() == id)
            .cloned()
    }

    /// Snapshot of every entry in deposit order.
    #[must_use]
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.entries.read().unwrap().clone()
    }

    /// Number of entries, dispatched or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether the outbox holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// Whether `id` has been marked dispatched.
    #[must_use]
    pub fn is_dispatched(&self, id: MessageId) -> bool {
        self.entry(id).is_some_and(|entry| entry.is_dispatched())
    }
}

impl OutboxStore for InMemoryOutbox {
    type Transaction = InMemoryTransaction;

    fn add<'a>(
        &'a self,
        message: &'a Message,
        deposited_at: DateTime<Utc>,
        transaction: Option<&'a mut InMemoryTransaction>,
    ) -> OutboxFuture<'a, bool> {
        Box::pin(async move {
            self.check_available()?;
            let id = message.id();
            // Check and insert under one write lock so racing adds of one id insert once.
            let mut entries = self.entries.write().unwrap();
            if entries.iter().any(|entry| entry.message.id() == id) {
                return Ok(false);
            }
            let entry = OutboxEntry::new(message.clone(), deposited_at);
            match transaction {
                Some(transaction) => {
                    if transaction.contains(id) {
                        return Ok(false);
                    }
                    transaction.staged.push(entry);
                }
                None => entries.push(entry),
            }
            Ok(true)
        })
    }

    fn get(&self, id: MessageId) -> OutboxFuture<'_, Option<OutboxEntry>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.entry(id))
        })
    }

    fn mark_dispatched(&self, id: MessageId, at: DateTime<Utc>) -> OutboxFuture<'_, bool> {
        Box::pin(async move {
            self.check_available()?;
            let mut entries = self.entries.write().unwrap();
            let entry = entries
                .iter_mut()
                .find(|entry| entry.message.id() == id)
                .ok_or(OutboxError::NotFound(id))?;
            Ok(entry.mark_dispatched(at))
        })
    }

    fn outstanding_messages(
        &self,
        older_than: DateTime<Utc>,
        page_size: usize,
    ) -> OutboxFuture<'_, Vec<OutboxEntry>> {
        Box::pin(async move {
            self.check_available()?;
            let mut outstanding: Vec<_> = self
                .entries
                .read()
                .unwrap()
                .iter()
                .filter(|entry| !entry.is_dispatched() && entry.deposited_at <= older_than)
                .cloned()
                .collect();
            outstanding.sort_by_key(|entry| entry.deposited_at);
            outstanding.truncate(page_size);
            Ok(outstanding)
        })
    }

    fn outstanding_count(&self) -> OutboxFuture<'_, usize> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self
                .entries
                .read()
                .unwrap()
                .iter()
                .filter(|entry| !entry.is_dispatched())
                .count())
        })
    }

    fn dispatched_messages(
        &self,
        since: DateTime<Utc>,
        page_size: usize,
    ) -> OutboxFuture<'_, Vec<OutboxEntry>> {
        Box::pin(async move {
            self.check_available()?;
            let mut dispatched: Vec<_> = self
                .entries
                .read()
                .unwrap()
                .iter()
                .filter(|entry| entry.dispatched_at.is_some_and(|at| at >= since))
                .cloned()
                .collect();
            dispatched.sort_by_key(|entry| std::cmp::Reverse(entry.dispatched_at));
            dispatched.truncate(page_size);
            Ok(dispatched)
        })
    }

    fn delete<'a>(&'a self, ids: &'a [MessageId]) -> OutboxFuture<'a, usize> {
        Box::pin(async move {
            self.check_available()?;
            let mut entries = self.entries.write().unwrap();
            let before = entries.len();
            entries.retain(|entry| !ids.contains(&entry.message.id()));
            Ok(before - entries.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_clock;
    use courier_core::environment::Clock;
    use courier_core::message::{MessageBody, MessageHeader, MessageType};

    fn message() -> Message {
        Message::new(
            MessageHeader::new(MessageId::new(), "orders".into(), MessageType::Event),
            MessageBody::new(b"{}".to_vec(), "application/json"),
        )
    }

    #[tokio::test]
    async fn duplicate_add_is_not_an_insert() {
        let outbox = InMemoryOutbox::new();
        let message = message();
        let now = test_clock().now();

        assert!(outbox.add(&message, now, None).await.unwrap());
        assert!(!outbox.add(&message, now, None).await.unwrap());
        assert_eq!(outbox.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_adds_of_one_message_insert_it_once() {
        let outbox = InMemoryOutbox::new();
        let message = message();
        let now = test_clock().now();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let outbox = outbox.clone();
                let message = message.clone();
                tokio::spawn(async move { outbox.add(&message, now, None).await.unwrap() })
            })
            .collect();
        let mut inserted = 0;
        for task in tasks {
            if task.await.unwrap() {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 1);
        assert_eq!(outbox.len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_staged_deposits() {
        let outbox = InMemoryOutbox::new();
        let mut transaction = outbox.begin();

        outbox
            .add(&message(), test_clock().now(), Some(&mut transaction))
            .await
            .unwrap();
        assert_eq!(transaction.len(), 1);
        transaction.rollback();

        assert!(outbox.is_empty());
    }

    #[tokio::test]
    async fn mark_dispatched_transitions_once() {
        let outbox = InMemoryOutbox::new();
        let message = message();
        let now = test_clock().now();
        outbox.add(&message, now, None).await.unwrap();

        assert!(outbox.mark_dispatched(message.id(), now).await.unwrap());
        assert!(!outbox.mark_dispatched(message.id(), now).await.unwrap());
        assert_eq!(outbox.entry(message.id()).unwrap().dispatched_at, Some(now));
        assert_eq!(outbox.outstanding_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unavailable_outbox_fails_every_call() {
        let outbox = InMemoryOutbox::new();
        outbox.set_unavailable(true);

        assert!(matches!(
            outbox.outstanding_count().await,
            Err(OutboxError::Storage(_))
        ));
        assert!(outbox.commit(outbox.begin()).is_err());
    }
}
