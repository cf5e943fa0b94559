//! Outbox-producer mediator: deposit, clear, sweep.
//!
//! A reliable send has two halves. **Deposit** writes the message to the outbox, inside the
//! caller's transaction when there is one. **Clear** hands the stored message to its producer
//! under the outbox resilience policy and marks the entry dispatched. Anything that fails to
//! clear stays outstanding and is picked up by a later [`OutboxProducerMediator::sweep`].
//!
//! Guarantees:
//!
//! - at most one clear per message id is in flight in this process; a second concurrent
//!   clear of the same id returns [`ClearOutcome::AlreadyInFlight`] without sending
//! - marking dispatched is a store-side compare-and-set, so a sweep and a direct clear
//!   racing across processes still leave a single `dispatched_at`
//! - deposits are refused with [`DispatchError::OutboxFull`] once the outstanding count
//!   reaches the configured ceiling; capacity is reserved before the store write, so
//!   concurrent deposits cannot overshoot it

use crate::SystemClock;
use crate::policy::{DEFAULT_OUTBOX_POLICY, PolicyFailure, PolicyRegistry};
use crate::producer_registry::ProducerRegistry;
use courier_core::context::RequestContext;
use courier_core::environment::Clock;
use courier_core::error::{ConfigurationError, DispatchError};
use courier_core::mapper::{MapperError, MessageMapperRegistry};
use courier_core::message::{Message, MessageId, RoutingKey};
use courier_core::observer::{DispatchEvent, DispatchObserver, NoopObserver, Outcome};
use courier_core::outbox::{OutboxEntry, OutboxError, OutboxStore};
use courier_core::producer::{MessageProducer, ProducerError};
use courier_core::request::Request;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Outbox behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxConfig {
    /// Refuse deposits once this many messages are outstanding. `None` disables the check.
    pub max_outstanding: Option<usize>,
    /// How long a cached outstanding count is trusted before asking the store again.
    pub outstanding_check_interval: Duration,
    /// Sweep only entries deposited at least this long ago.
    pub sweep_min_age: Duration,
    /// Maximum entries one sweep picks up.
    pub sweep_batch_size: usize,
    /// Send swept messages to each producer with one batched call.
    pub sweep_use_bulk: bool,
    /// Name of the resilience policy wrapped around producer sends.
    pub policy: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_outstanding: None,
            outstanding_check_interval: Duration::from_secs(1),
            sweep_min_age: Duration::from_secs(5),
            sweep_batch_size: 100,
            sweep_use_bulk: false,
            policy: DEFAULT_OUTBOX_POLICY.to_string(),
        }
    }
}

impl OutboxConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the outstanding ceiling.
    #[must_use]
    pub const fn with_max_outstanding(mut self, max: usize) -> Self {
        self.max_outstanding = Some(max);
        self
    }

    /// Set how long a cached outstanding count is trusted.
    #[must_use]
    pub const fn with_outstanding_check_interval(mut self, interval: Duration) -> Self {
        self.outstanding_check_interval = interval;
        self
    }

    /// Set the sweep minimum age.
    #[must_use]
    pub const fn with_sweep_min_age(mut self, min_age: Duration) -> Self {
        self.sweep_min_age = min_age;
        self
    }

    /// Set the sweep batch size.
    #[must_use]
    pub const fn with_sweep_batch_size(mut self, batch_size: usize) -> Self {
        self.sweep_batch_size = batch_size;
        self
    }

    /// Enable batched sends during sweeps.
    #[must_use]
    pub const fn with_sweep_use_bulk(mut self, use_bulk: bool) -> Self {
        self.sweep_use_bulk = use_bulk;
        self
    }

    /// Use the named resilience policy for producer sends.
    #[must_use]
    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = policy.into();
        self
    }
}

/// Parameters of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOptions {
    /// Only entries deposited at least this long ago.
    pub min_age: Duration,
    /// Maximum entries picked up.
    pub batch_size: usize,
    /// Send to each producer with one batched call.
    pub use_bulk: bool,
}

impl From<&OutboxConfig> for SweepOptions {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            min_age: config.sweep_min_age,
            batch_size: config.sweep_batch_size,
            use_bulk: config.sweep_use_bulk,
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Outstanding entries selected.
    pub attempted: usize,
    /// Entries marked dispatched (or handed to a confirming producer).
    pub dispatched: usize,
    /// Entries whose send failed; they stay outstanding.
    pub failed: usize,
    /// Entries skipped because they were in flight or already dispatched.
    pub skipped: usize,
}

/// Result of clearing one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    /// Sent and marked dispatched.
    Dispatched,
    /// Sent; the producer will confirm publication later.
    AwaitingConfirmation,
    /// The entry was already dispatched; nothing was sent.
    AlreadyDispatched,
    /// Another clear of the same id is running; nothing was sent.
    AlreadyInFlight,
}

/// Removes an id from the in-flight set when dropped.
struct InFlightGuard<'m> {
    in_flight: &'m Mutex<HashSet<MessageId>>,
    id: MessageId,
}

impl<'m> InFlightGuard<'m> {
    fn acquire(in_flight: &'m Mutex<HashSet<MessageId>>, id: MessageId) -> Option<Self> {
        let inserted = in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        inserted.then_some(Self { in_flight, id })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Local tally of undispatched entries.
#[derive(Debug, Default)]
struct Backlog {
    /// Entries known to be in the store and not yet dispatched.
    outstanding: usize,
    /// Slots held by deposits that have not finished writing.
    reserved: usize,
    /// Bumped on every local change; a store count read across a change is discarded.
    changes: u64,
    checked_at: Option<Instant>,
}

impl Backlog {
    const fn pending(&self) -> usize {
        self.outstanding.saturating_add(self.reserved)
    }
}

/// Capacity held for an in-progress deposit.
///
/// Dropping it gives back the unused slots and moves the used ones to `outstanding`.
struct Reservation<'m> {
    backlog: &'m Mutex<Backlog>,
    slots: usize,
    used: usize,
}

impl Reservation<'_> {
    const fn fill(&mut self) {
        self.used += 1;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut backlog = self.backlog.lock().unwrap_or_else(PoisonError::into_inner);
        backlog.reserved = backlog.reserved.saturating_sub(self.slots);
        backlog.outstanding = backlog.outstanding.saturating_add(self.used);
        backlog.changes = backlog.changes.wrapping_add(1);
        record_outstanding(backlog.outstanding);
    }
}

/// Moves messages from the outbox to their producers.
pub struct OutboxProducerMediator<S: OutboxStore> {
    store: Arc<S>,
    producers: ProducerRegistry,
    mappers: MessageMapperRegistry,
    policies: PolicyRegistry,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn DispatchObserver>,
    config: OutboxConfig,
    backlog: Mutex<Backlog>,
    in_flight: Mutex<HashSet<MessageId>>,
}

impl<S: OutboxStore> OutboxProducerMediator<S> {
    /// Mediator over `store`, delivering through `producers` and mapping with `mappers`.
    ///
    /// Uses the default policies, the system clock, no observer and [`OutboxConfig::default`].
    #[must_use]
    pub fn new(store: Arc<S>, producers: ProducerRegistry, mappers: MessageMapperRegistry) -> Self {
        Self {
            store,
            producers,
            mappers,
            policies: PolicyRegistry::with_defaults(),
            clock: Arc::new(SystemClock),
            observer: Arc::new(NoopObserver),
            config: OutboxConfig::default(),
            backlog: Mutex::new(Backlog::default()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve the send policy from `policies`.
    #[must_use]
    pub fn with_policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    /// Read time from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Report events to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Use `config`.
    #[must_use]
    pub fn with_config(mut self, config: OutboxConfig) -> Self {
        self.config = config;
        self
    }

    /// The outbox store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The producer registry.
    #[must_use]
    pub const fn producers(&self) -> &ProducerRegistry {
        &self.producers
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Sweep options derived from the configuration.
    #[must_use]
    pub fn sweep_options(&self) -> SweepOptions {
        SweepOptions::from(&self.config)
    }

    /// Outstanding count as last seen, without asking the store.
    #[must_use]
    pub fn outstanding_estimate(&self) -> usize {
        self.backlog().outstanding
    }

    fn backlog(&self) -> MutexGuard<'_, Backlog> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map `request` to its outgoing message using its publication and mapper.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Mapping`] when no mapper or publication exists for `R`, or
    /// when the mapper fails.
    pub fn create_message<R: Request>(
        &self,
        request: &R,
        context: &RequestContext,
    ) -> Result<Message, DispatchError> {
        let mapper = self.mappers.require::<R>()?;
        let publication = self
            .producers
            .find_publication::<R>()
            .ok_or_else(|| MapperError::NoPublication(std::any::type_name::<R>().to_string()))?;
        Ok(mapper.map_to_message(request, publication, context)?)
    }

    /// Write `message` to the outbox, inside `transaction` when given.
    ///
    /// Returns `true` when the message was added and `false` when an entry with the same
    /// id already existed; duplicates are not an error.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::OutboxFull`] when the outstanding ceiling is reached
    /// - [`DispatchError::Outbox`] when the store fails
    pub async fn deposit(
        &self,
        message: &Message,
        transaction: Option<&mut S::Transaction>,
    ) -> Result<bool, DispatchError> {
        let mut reservation = self.reserve(1).await?;
        let inserted = self.add(message, transaction).await?;
        if inserted {
            reservation.fill();
        }
        Ok(inserted)
    }

    /// Write several messages, inside `transaction` when given.
    ///
    /// Returns how many were newly added.
    ///
    /// # Errors
    ///
    /// Same as [`OutboxProducerMediator::deposit`]; the first store failure aborts the batch.
    pub async fn deposit_batch(
        &self,
        messages: &[Message],
        mut transaction: Option<&mut S::Transaction>,
    ) -> Result<usize, DispatchError> {
        let mut reservation = self.reserve(messages.len()).await?;
        let mut added = 0;
        for message in messages {
            if self.add(message, transaction.as_deref_mut()).await? {
                reservation.fill();
                added += 1;
            }
        }
        Ok(added)
    }

    async fn add(
        &self,
        message: &Message,
        transaction: Option<&mut S::Transaction>,
    ) -> Result<bool, DispatchError> {
        let inserted = match self.store.add(message, self.clock.now(), transaction).await {
            Ok(inserted) => inserted,
            Err(OutboxError::DuplicateMessage(_)) => false,
            Err(err) => {
                metrics::counter!("courier_outbox_deposit_total", "outcome" => "failure")
                    .increment(1);
                tracing::error!(
                    message_id = %message.id(),
                    topic = %message.topic(),
                    error = %err,
                    "Deposit failed"
                );
                self.observer.on_event(&DispatchEvent::Deposited {
                    topic: message.topic().clone(),
                    message_id: message.id(),
                    outcome: Outcome::Failure(err.to_string()),
                });
                return Err(err.into());
            }
        };

        let outcome = if inserted {
            tracing::debug!(
                message_id = %message.id(),
                topic = %message.topic(),
                "Message deposited"
            );
            Outcome::Success
        } else {
            tracing::warn!(
                message_id = %message.id(),
                topic = %message.topic(),
                "Duplicate deposit ignored"
            );
            Outcome::Skipped
        };
        metrics::counter!("courier_outbox_deposit_total", "outcome" => outcome.as_str())
            .increment(1);
        self.observer.on_event(&DispatchEvent::Deposited {
            topic: message.topic().clone(),
            message_id: message.id(),
            outcome,
        });
        Ok(inserted)
    }

    /// Hold `incoming` slots, refusing them once the ceiling would be crossed.
    async fn reserve(&self, incoming: usize) -> Result<Reservation<'_>, DispatchError> {
        let Some(limit) = self.config.max_outstanding else {
            return Ok(self.hold(incoming));
        };

        if self.count_is_stale() {
            self.reconcile().await?;
        }
        if let Some(reservation) = self.try_hold(incoming, limit) {
            return Ok(reservation);
        }
        // the cached count may be stale; the store decides
        self.reconcile().await?;
        self.try_hold(incoming, limit).ok_or_else(|| {
            let outstanding = self.backlog().pending();
            tracing::warn!(outstanding, limit, "Outbox full, refusing deposit");
            metrics::counter!("courier_outbox_deposit_total", "outcome" => "full").increment(1);
            DispatchError::OutboxFull { outstanding, limit }
        })
    }

    fn try_hold(&self, incoming: usize, limit: usize) -> Option<Reservation<'_>> {
        let mut backlog = self.backlog();
        if backlog.pending().saturating_add(incoming) > limit {
            return None;
        }
        backlog.reserved += incoming;
        backlog.changes = backlog.changes.wrapping_add(1);
        drop(backlog);
        Some(self.reservation(incoming))
    }

    fn hold(&self, incoming: usize) -> Reservation<'_> {
        let mut backlog = self.backlog();
        backlog.reserved = backlog.reserved.saturating_add(incoming);
        backlog.changes = backlog.changes.wrapping_add(1);
        drop(backlog);
        self.reservation(incoming)
    }

    const fn reservation(&self, slots: usize) -> Reservation<'_> {
        Reservation {
            backlog: &self.backlog,
            slots,
            used: 0,
        }
    }

    fn count_is_stale(&self) -> bool {
        self.backlog()
            .checked_at
            .is_none_or(|at| at.elapsed() >= self.config.outstanding_check_interval)
    }

    /// Refresh the outstanding tally from the store.
    ///
    /// A count read while a local deposit or dispatch landed is discarded in favour of the
    /// local tally, so a stale read never lowers it.
    async fn reconcile(&self) -> Result<usize, DispatchError> {
        let seen = self.backlog().changes;
        let count = self.store.outstanding_count().await?;

        let mut backlog = self.backlog();
        if backlog.changes == seen {
            backlog.outstanding = count;
        }
        backlog.checked_at = Some(Instant::now());
        record_outstanding(backlog.outstanding);
        Ok(backlog.outstanding)
    }

    /// Number of undispatched entries, read from the store.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Outbox`] when the store fails.
    pub async fn outstanding_count(&self) -> Result<usize, DispatchError> {
        self.reconcile().await
    }

    /// Clear each id in turn.
    ///
    /// Every id is attempted even when an earlier one fails; the first failure is returned
    /// after all have been tried, and failed entries stay outstanding.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by [`OutboxProducerMediator::clear_one`].
    pub async fn clear(
        &self,
        ids: &[MessageId],
        context: &RequestContext,
    ) -> Result<Vec<ClearOutcome>, DispatchError> {
        let mut outcomes = Vec::with_capacity(ids.len());
        let mut first_error = None;
        for id in ids {
            match self.clear_one(*id, context).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(outcomes), Err)
    }

    /// Send one stored message to its producer and mark it dispatched.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Outbox`] when the entry does not exist or the store fails
    /// - [`DispatchError::Delivery`] when no producer matches or every send attempt failed
    /// - [`DispatchError::BrokenCircuit`] when the send policy's breaker is open
    /// - [`DispatchError::Configuration`] when the send policy is not registered
    pub async fn clear_one(
        &self,
        id: MessageId,
        context: &RequestContext,
    ) -> Result<ClearOutcome, DispatchError> {
        let span = crate::observability::clear_span(context, id);
        self.clear_guarded(id).instrument(span).await
    }

    async fn clear_guarded(&self, id: MessageId) -> Result<ClearOutcome, DispatchError> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, id) else {
            tracing::debug!(message_id = %id, "Clear already in flight");
            return Ok(ClearOutcome::AlreadyInFlight);
        };

        let entry = self
            .store
            .get(id)
            .await?
            .ok_or(DispatchError::Outbox(OutboxError::NotFound(id)))?;
        if entry.is_dispatched() {
            return Ok(ClearOutcome::AlreadyDispatched);
        }

        let message = &entry.message;
        let producer = match self.producers.resolve(message) {
            Ok(producer) => producer,
            Err(err) => {
                self.clear_attempted(message, Outcome::Failure(err.to_string()));
                return Err(err.into());
            }
        };

        match self.send(producer.as_ref(), message).await {
            Ok(()) => {
                self.clear_attempted(message, Outcome::Success);
                if producer.confirms_publication() {
                    return Ok(ClearOutcome::AwaitingConfirmation);
                }
                self.mark_dispatched(id, message.topic()).await?;
                Ok(ClearOutcome::Dispatched)
            }
            Err(err) => {
                self.clear_attempted(message, Outcome::Failure(err.to_string()));
                Err(err)
            }
        }
    }

    /// Send `message` under the outbox policy, honouring its delivery delay.
    async fn send(
        &self,
        producer: &dyn MessageProducer,
        message: &Message,
    ) -> Result<(), DispatchError> {
        let policy = self
            .policies
            .get(&self.config.policy)
            .map_err(ConfigurationError::from)?;
        let delay = Duration::from_millis(message.header().delay_ms());

        let result = policy
            .execute_async(
                move || {
                    if delay.is_zero() {
                        producer.send(message)
                    } else {
                        producer.send_with_delay(message, delay)
                    }
                },
                retryable,
            )
            .await;

        result.map_err(|failure| delivery_failure(failure, &self.config.policy, message.topic()))
    }

    async fn mark_dispatched(
        &self,
        id: MessageId,
        topic: &RoutingKey,
    ) -> Result<bool, DispatchError> {
        let transitioned = self.store.mark_dispatched(id, self.clock.now()).await?;
        let outcome = if transitioned {
            {
                let mut backlog = self.backlog();
                backlog.outstanding = backlog.outstanding.saturating_sub(1);
                backlog.changes = backlog.changes.wrapping_add(1);
                record_outstanding(backlog.outstanding);
            }
            tracing::debug!(message_id = %id, topic = %topic, "Message marked dispatched");
            Outcome::Success
        } else {
            tracing::debug!(
                message_id = %id,
                topic = %topic,
                "Message was already marked dispatched"
            );
            Outcome::Skipped
        };
        self.observer.on_event(&DispatchEvent::MarkedDispatched {
            topic: topic.clone(),
            message_id: id,
            outcome,
        });
        Ok(transitioned)
    }

    fn clear_attempted(&self, message: &Message, outcome: Outcome) {
        metrics::counter!("courier_outbox_clear_total", "outcome" => outcome.as_str()).increment(1);
        if let Outcome::Failure(reason) = &outcome {
            tracing::warn!(
                message_id = %message.id(),
                topic = %message.topic(),
                error = %reason,
                "Clear failed, message stays outstanding"
            );
        }
        self.observer.on_event(&DispatchEvent::ClearAttempted {
            topic: message.topic().clone(),
            message_id: message.id(),
            outcome,
        });
    }

    /// Publication-confirmation callback for producers that confirm asynchronously.
    ///
    /// A successful confirmation marks the entry dispatched; a negative one leaves it
    /// outstanding for the next sweep. Returns whether the entry was marked by this call.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Outbox`] when the entry does not exist or the store fails.
    pub async fn confirm_published(
        &self,
        id: MessageId,
        success: bool,
    ) -> Result<bool, DispatchError> {
        if !success {
            tracing::warn!(message_id = %id, "Producer reported failed publication");
            return Ok(false);
        }
        let entry = self
            .store
            .get(id)
            .await?
            .ok_or(DispatchError::Outbox(OutboxError::NotFound(id)))?;
        self.mark_dispatched(id, entry.message.topic()).await
    }

    /// Clear outstanding entries older than `options.min_age`.
    ///
    /// Send failures are counted in the report and leave the entries outstanding; only
    /// a failure to read the outbox fails the sweep itself.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Outbox`] when outstanding entries cannot be listed.
    pub async fn sweep(&self, options: &SweepOptions) -> Result<SweepReport, DispatchError> {
        let started = Instant::now();
        let cutoff = older_than(self.clock.now(), options.min_age);
        let entries = self
            .store
            .outstanding_messages(cutoff, options.batch_size)
            .await?;

        let mut report = SweepReport {
            attempted: entries.len(),
            ..SweepReport::default()
        };
        if options.use_bulk {
            self.sweep_bulk(entries, &mut report).await;
        } else {
            let context = RequestContext::new();
            for entry in &entries {
                match self.clear_one(entry.message.id(), &context).await {
                    Ok(ClearOutcome::Dispatched | ClearOutcome::AwaitingConfirmation) => {
                        report.dispatched += 1;
                    }
                    Ok(ClearOutcome::AlreadyDispatched | ClearOutcome::AlreadyInFlight) => {
                        report.skipped += 1;
                    }
                    Err(_) => report.failed += 1,
                }
            }
        }

        metrics::histogram!("courier_sweep_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                dispatched = report.dispatched,
                failed = report.failed,
                skipped = report.skipped,
                "Outbox sweep finished"
            );
        }
        self.observer.on_event(&DispatchEvent::Swept {
            attempted: report.attempted,
            dispatched: report.dispatched,
            failed: report.failed,
        });
        Ok(report)
    }

    /// Group entries by producer and send each group with one batched call.
    ///
    /// Every entry is re-read under its in-flight guard; one dispatched since the listing is
    /// skipped. Messages carrying a delivery delay go one by one through the delayed send.
    async fn sweep_bulk(&self, entries: Vec<OutboxEntry>, report: &mut SweepReport) {
        type Group = (Arc<dyn MessageProducer>, Vec<Message>);
        let mut groups: BTreeMap<RoutingKey, Group> = BTreeMap::new();
        let mut delayed: Vec<(Arc<dyn MessageProducer>, Message)> = Vec::new();
        let mut guards = Vec::with_capacity(entries.len());

        for listed in entries {
            let id = listed.message.id();
            let Some(guard) = InFlightGuard::acquire(&self.in_flight, id) else {
                report.skipped += 1;
                continue;
            };
            let entry = match self.store.get(id).await {
                Ok(Some(entry)) if !entry.is_dispatched() => entry,
                Ok(_) => {
                    tracing::debug!(message_id = %id, "Entry dispatched since listing");
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    self.clear_attempted(&listed.message, Outcome::Failure(err.to_string()));
                    report.failed += 1;
                    continue;
                }
            };
            match self.producers.resolve(&entry.message) {
                Ok(producer) => {
                    guards.push(guard);
                    if entry.message.header().delay_ms() > 0 {
                        delayed.push((Arc::clone(producer), entry.message));
                        continue;
                    }
                    let topic = producer.publication().topic().clone();
                    groups
                        .entry(topic)
                        .or_insert_with(|| (Arc::clone(producer), Vec::new()))
                        .1
                        .push(entry.message);
                }
                Err(err) => {
                    self.clear_attempted(&entry.message, Outcome::Failure(err.to_string()));
                    report.failed += 1;
                }
            }
        }

        for (topic, (producer, messages)) in &groups {
            match self.send_batch(producer.as_ref(), messages, topic).await {
                Ok(sent) => {
                    let sent: HashSet<MessageId> = sent.into_iter().collect();
                    for message in messages {
                        if sent.contains(&message.id()) {
                            self.swept(producer.as_ref(), message, report).await;
                        } else {
                            report.failed += 1;
                        }
                    }
                }
                Err(err) => {
                    for message in messages {
                        self.clear_attempted(message, Outcome::Failure(err.to_string()));
                    }
                    report.failed += messages.len();
                }
            }
        }

        for (producer, message) in &delayed {
            match self.send(producer.as_ref(), message).await {
                Ok(()) => self.swept(producer.as_ref(), message, report).await,
                Err(err) => {
                    self.clear_attempted(message, Outcome::Failure(err.to_string()));
                    report.failed += 1;
                }
            }
        }
        drop(guards);
    }

    /// Record a message a bulk sweep has handed to `producer`.
    async fn swept(
        &self,
        producer: &dyn MessageProducer,
        message: &Message,
        report: &mut SweepReport,
    ) {
        self.clear_attempted(message, Outcome::Success);
        if producer.confirms_publication() {
            report.dispatched += 1;
            return;
        }
        match self.mark_dispatched(message.id(), message.topic()).await {
            Ok(true) => report.dispatched += 1,
            Ok(false) => report.skipped += 1,
            Err(_) => report.failed += 1,
        }
    }

    async fn send_batch(
        &self,
        producer: &dyn MessageProducer,
        messages: &[Message],
        topic: &RoutingKey,
    ) -> Result<Vec<MessageId>, DispatchError> {
        let policy = self
            .policies
            .get(&self.config.policy)
            .map_err(ConfigurationError::from)?;
        policy
            .execute_async(move || producer.send_batch(messages), retryable)
            .await
            .map_err(|failure| delivery_failure(failure, &self.config.policy, topic))
    }

    /// Delete entries. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Outbox`] when the store fails.
    pub async fn purge(&self, ids: &[MessageId]) -> Result<usize, DispatchError> {
        let removed = self.store.delete(ids).await?;
        tracing::info!(requested = ids.len(), removed, "Outbox entries purged");
        self.reconcile().await?;
        Ok(removed)
    }

    /// Entries dispatched at or after `since`, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Outbox`] when the store fails.
    pub async fn dispatched_messages(
        &self,
        since: DateTime<Utc>,
        page_size: usize,
    ) -> Result<Vec<OutboxEntry>, DispatchError> {
        Ok(self.store.dispatched_messages(since, page_size).await?)
    }
}

impl<S: OutboxStore> std::fmt::Debug for OutboxProducerMediator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxProducerMediator")
            .field("producers", &self.producers)
            .field("config", &self.config)
            .field("outstanding", &self.outstanding_estimate())
            .finish_non_exhaustive()
    }
}

/// Producer failures worth another attempt; a missing delay capability never goes away.
const fn retryable(err: &ProducerError) -> bool {
    !matches!(err, ProducerError::DelayNotSupported(_))
}

/// Translate a failed policy execution around a producer call.
fn delivery_failure(
    failure: PolicyFailure<ProducerError>,
    policy: &str,
    topic: &RoutingKey,
) -> DispatchError {
    match failure {
        PolicyFailure::Inner(err) => DispatchError::Delivery(err),
        PolicyFailure::BrokenCircuit => DispatchError::BrokenCircuit {
            policy: policy.to_string(),
        },
        PolicyFailure::TimedOut(after) => DispatchError::Delivery(ProducerError::SendFailed {
            topic: topic.clone(),
            reason: format!("timed out after {}ms", after.as_millis()),
        }),
    }
}

/// `now - min_age`, clamped to the earliest representable instant.
fn older_than(now: DateTime<Utc>, min_age: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(min_age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[allow(clippy::cast_precision_loss)]
fn record_outstanding(count: usize) {
    metrics::gauge!("courier_outbox_outstanding").set(count as f64);
}
