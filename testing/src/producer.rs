//! Scriptable in-memory message producer.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use courier_core::message::{Message, MessageId};
use courier_core::producer::{MessageProducer, ProducerError, ProducerFuture};
use courier_core::publication::Publication;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Producer that records what it sends and fails on demand.
///
/// # Example
///
/// ```
/// use courier_testing::InMemoryProducer;
/// use courier_core::publication::Publication;
///
/// let producer = InMemoryProducer::new(Publication::new("orders"));
/// producer.fail_next(2);
/// assert_eq!(producer.attempts(), 0);
/// assert!(producer.sent().is_empty());
/// ```
#[derive(Debug)]
pub struct InMemoryProducer {
    publication: Publication,
    sent: Mutex<Vec<Message>>,
    delays: Mutex<Vec<(MessageId, Duration)>>,
    attempts: AtomicUsize,
    batches: AtomicUsize,
    failures_remaining: AtomicUsize,
    fail_always: AtomicBool,
    supports_delay: bool,
    confirms: bool,
    latency: Option<Duration>,
}

impl InMemoryProducer {
    /// Producer for `publication` that always succeeds.
    #[must_use]
    pub fn new(publication: Publication) -> Self {
        Self {
            publication,
            sent: Mutex::new(Vec::new()),
            delays: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            fail_always: AtomicBool::new(false),
            supports_delay: false,
            confirms: false,
            latency: None,
        }
    }

    /// Accept delayed sends.
    #[must_use]
    pub const fn with_delay_support(mut self) -> Self {
        self.supports_delay = true;
        self
    }

    /// Report that publication is confirmed later through a callback.
    #[must_use]
    pub const fn with_confirmation(mut self) -> Self {
        self.confirms = true;
        self
    }

    /// Sleep for `latency` before every send.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `count` send attempts.
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Fail every send attempt until called with `false`.
    pub fn fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    /// Messages delivered so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    /// Ids of messages delivered so far, in order.
    #[must_use]
    pub fn sent_ids(&self) -> Vec<MessageId> {
        self.sent.lock().unwrap().iter().map(Message::id).collect()
    }

    /// Delays requested for delivered delayed sends.
    #[must_use]
    pub fn delays(&self) -> Vec<(MessageId, Duration)> {
        self.delays.lock().unwrap().clone()
    }

    /// Send attempts, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Batched send calls.
    #[must_use]
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        self.fail_always.load(Ordering::SeqCst)
            || self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }

    async fn deliver(&self, message: &Message) -> Result<(), ProducerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.should_fail() {
            return Err(ProducerError::SendFailed {
                topic: self.publication.topic().clone(),
                reason: "scripted failure".to_string(),
            });
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

impl MessageProducer for InMemoryProducer {
    fn publication(&self) -> &Publication {
        &self.publication
    }

    fn send<'a>(&'a self, message: &'a Message) -> ProducerFuture<'a, ()> {
        Box::pin(self.deliver(message))
    }

    fn send_with_delay<'a>(
        &'a self,
        message: &'a Message,
        delay: Duration,
    ) -> ProducerFuture<'a, ()> {
        Box::pin(async move {
            if !self.supports_delay {
                return Err(ProducerError::DelayNotSupported(self.publication.topic().clone()));
            }
            self.deliver(message).await?;
            self.delays.lock().unwrap().push((message.id(), delay));
            Ok(())
        })
    }

    fn send_batch<'a>(&'a self, messages: &'a [Message]) -> ProducerFuture<'a, Vec<MessageId>> {
        Box::pin(async move {
            self.batches.fetch_add(1, Ordering::SeqCst);
            let mut sent = Vec::with_capacity(messages.len());
            for message in messages {
                self.deliver(message).await?;
                sent.push(message.id());
            }
            Ok(sent)
        })
    }

    fn confirms_publication(&self) -> bool {
        self.confirms
    }
}
