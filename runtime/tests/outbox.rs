//! Integration tests for post, deposit/clear, sweeping and the outbox guarantees.

// Test code can use unwrap/expect/panic
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::*;
use courier_core::prelude::*;
use courier_runtime::prelude::*;
use courier_core::{DateTime, Utc};
use courier_testing::{
    FixedClock, InMemoryOutbox, InMemoryProducer, InMemoryTransaction, RecordingObserver,
    test_clock,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    outbox: InMemoryOutbox,
    producer: Arc<InMemoryProducer>,
    clock: FixedClock,
    observer: RecordingObserver,
    mediator: Arc<OutboxProducerMediator<InMemoryOutbox>>,
    dispatcher: Dispatcher<SimpleHandlerFactory, SimpleHandlerFactory, InMemoryOutbox>,
}

fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(attempts)
        .initial_delay(Duration::from_millis(1))
        .build()
}

/// Default policies with a quick three-attempt outbox policy.
fn fast_policies() -> PolicyRegistry {
    PolicyRegistry::with_defaults().with_policy(
        DEFAULT_OUTBOX_POLICY,
        ResiliencePolicy::new().with_retry(fast_retry(3)),
    )
}

fn orders_producer() -> InMemoryProducer {
    InMemoryProducer::new(Publication::new("orders").for_request::<MyCommand>())
}

fn events_producer() -> InMemoryProducer {
    InMemoryProducer::new(Publication::new("events").for_request::<MyEvent>())
}

fn build(
    producers: Vec<Arc<InMemoryProducer>>,
    config: OutboxConfig,
    policies: PolicyRegistry,
) -> Harness {
    let outbox = InMemoryOutbox::new();
    let clock = test_clock();
    let observer = RecordingObserver::new();

    let mut mappers = MessageMapperRegistry::new();
    mappers.register_json::<MyCommand>().register_json::<MyEvent>();
    let registry = ProducerRegistry::new(
        producers
            .iter()
            .map(|producer| Arc::clone(producer) as Arc<dyn MessageProducer>)
            .collect(),
    );

    let mediator = Arc::new(
        OutboxProducerMediator::new(Arc::new(outbox.clone()), registry, mappers)
            .with_policies(policies)
            .with_clock(Arc::new(clock.clone()))
            .with_observer(Arc::new(observer.clone()))
            .with_config(config),
    );
    let dispatcher = Dispatcher::builder(SubscriberRegistry::new(), SimpleHandlerFactory::new())
        .with_outbox(Arc::clone(&mediator))
        .build();

    Harness {
        outbox,
        producer: Arc::clone(&producers[0]),
        clock,
        observer,
        mediator,
        dispatcher,
    }
}

fn harness(producer: InMemoryProducer) -> Harness {
    build(vec![Arc::new(producer)], OutboxConfig::default(), fast_policies())
}

fn sweep_now(batch_size: usize) -> SweepOptions {
    SweepOptions {
        min_age: Duration::ZERO,
        batch_size,
        use_bulk: false,
    }
}

fn message_id(command: &MyCommand) -> MessageId {
    MessageId::from(command.id)
}

fn order_message() -> Message {
    Message::new(
        MessageHeader::new(MessageId::new(), "orders".into(), MessageType::Command)
            .with_type_name(std::any::type_name::<MyCommand>()),
        MessageBody::new(b"{}".to_vec(), "application/json"),
    )
}

/// In-memory outbox that pauses inside `add` and after listing, so racing callers overtake it.
#[derive(Clone, Default)]
struct LaggingOutbox {
    inner: InMemoryOutbox,
    add_lag: Duration,
    list_lag: Duration,
}

impl OutboxStore for LaggingOutbox {
    type Transaction = InMemoryTransaction;

    fn add<'a>(
        &'a self,
        message: &'a Message,
        deposited_at: DateTime<Utc>,
        transaction: Option<&'a mut InMemoryTransaction>,
    ) -> OutboxFuture<'a, bool> {
        Box::pin(async move {
            tokio::time::sleep(self.add_lag).await;
            self.inner.add(message, deposited_at, transaction).await
        })
    }

    fn get(&self, id: MessageId) -> OutboxFuture<'_, Option<OutboxEntry>> {
        self.inner.get(id)
    }

    fn mark_dispatched(&self, id: MessageId, at: DateTime<Utc>) -> OutboxFuture<'_, bool> {
        self.inner.mark_dispatched(id, at)
    }

    fn outstanding_messages(
        &self,
        older_than: DateTime<Utc>,
        page_size: usize,
    ) -> OutboxFuture<'_, Vec<OutboxEntry>> {
        Box::pin(async move {
            let entries = self.inner.outstanding_messages(older_than, page_size).await?;
            tokio::time::sleep(self.list_lag).await;
            Ok(entries)
        })
    }

    fn outstanding_count(&self) -> OutboxFuture<'_, usize> {
        self.inner.outstanding_count()
    }

    fn dispatched_messages(
        &self,
        since: DateTime<Utc>,
        page_size: usize,
    ) -> OutboxFuture<'_, Vec<OutboxEntry>> {
        self.inner.dispatched_messages(since, page_size)
    }

    fn delete<'a>(&'a self, ids: &'a [MessageId]) -> OutboxFuture<'a, usize> {
        self.inner.delete(ids)
    }
}

fn lagging_mediator(
    store: LaggingOutbox,
    producer: Arc<dyn MessageProducer>,
    config: OutboxConfig,
) -> OutboxProducerMediator<LaggingOutbox> {
    let mut mappers = MessageMapperRegistry::new();
    mappers.register_json::<MyCommand>();
    OutboxProducerMediator::new(Arc::new(store), ProducerRegistry::new(vec![producer]), mappers)
        .with_policies(fast_policies())
        .with_clock(Arc::new(test_clock()))
        .with_config(config)
}

fn bulk_sweep_now() -> SweepOptions {
    SweepOptions {
        use_bulk: true,
        ..sweep_now(10)
    }
}

/// Producer whose batched send always reports a missing delay capability.
struct DelaylessBatches {
    publication: Publication,
    batch_calls: AtomicUsize,
}

impl MessageProducer for DelaylessBatches {
    fn publication(&self) -> &Publication {
        &self.publication
    }

    fn send<'a>(&'a self, _message: &'a Message) -> ProducerFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn send_batch<'a>(&'a self, _messages: &'a [Message]) -> ProducerFuture<'a, Vec<MessageId>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let topic = self.publication.topic().clone();
        Box::pin(async move { Err(ProducerError::DelayNotSupported(topic)) })
    }
}

// ============================================================================
// post
// ============================================================================

#[tokio::test]
async fn post_delivers_and_marks_dispatched() {
    let h = harness(orders_producer());
    let command = MyCommand::new(42);

    h.dispatcher.post_async(&command).await.unwrap();

    let id = message_id(&command);
    assert_eq!(h.producer.sent_ids(), vec![id]);
    assert!(h.outbox.is_dispatched(id));
    assert_eq!(h.mediator.outstanding_count().await.unwrap(), 0);

    let sent = &h.producer.sent()[0];
    assert_eq!(sent.topic().as_str(), "orders");
    assert_eq!(sent.header().message_type(), MessageType::Command);
    let body: MyCommand = serde_json::from_slice(sent.body().bytes()).unwrap();
    assert_eq!(body, command);
}

#[tokio::test]
async fn post_succeeds_on_the_last_allowed_attempt() {
    let h = harness(orders_producer());
    h.producer.fail_next(2);
    let command = MyCommand::new(3);

    h.dispatcher.post_async(&command).await.unwrap();

    assert_eq!(h.producer.attempts(), 3);
    assert!(h.outbox.is_dispatched(message_id(&command)));
}

#[tokio::test]
async fn failed_post_leaves_the_message_for_the_sweeper() {
    let h = harness(orders_producer());
    h.producer.fail_always(true);
    let command = MyCommand::new(1);
    let id = message_id(&command);

    let err = h.dispatcher.post_async(&command).await.unwrap_err();

    assert!(matches!(err, DispatchError::Delivery(ProducerError::SendFailed { .. })));
    assert_eq!(h.producer.attempts(), 3);
    assert!(!h.outbox.is_dispatched(id));
    assert_eq!(h.mediator.outstanding_count().await.unwrap(), 1);

    h.producer.fail_always(false);
    let report = h.mediator.sweep(&sweep_now(10)).await.unwrap();

    assert_eq!(
        report,
        SweepReport {
            attempted: 1,
            dispatched: 1,
            failed: 0,
            skipped: 0
        }
    );
    assert!(h.outbox.is_dispatched(id));
    assert_eq!(h.producer.sent_ids(), vec![id]);
}

#[tokio::test]
async fn post_without_a_mapper_fails_before_depositing() {
    let outbox = InMemoryOutbox::new();
    let mediator = Arc::new(OutboxProducerMediator::new(
        Arc::new(outbox.clone()),
        ProducerRegistry::new(vec![Arc::new(orders_producer())]),
        MessageMapperRegistry::new(),
    ));
    let dispatcher = Dispatcher::builder(SubscriberRegistry::new(), SimpleHandlerFactory::new())
        .with_outbox(mediator)
        .build();

    let err = dispatcher.post_async(&MyCommand::new(1)).await.unwrap_err();

    assert!(matches!(err, DispatchError::Mapping(MapperError::NotRegistered(_))));
    assert!(outbox.is_empty());
}

#[tokio::test]
async fn post_without_a_publication_is_a_mapping_error() {
    let h = harness(orders_producer());

    let err = h.dispatcher.post_async(&MyEvent::new()).await.unwrap_err();

    assert!(matches!(err, DispatchError::Mapping(MapperError::NoPublication(_))));
    assert!(h.outbox.is_empty());
}

#[tokio::test]
async fn cancelled_post_deposits_nothing() {
    let h = harness(orders_producer());
    let token = CancellationToken::new();
    token.cancel();

    let result = h
        .dispatcher
        .post_async_with_cancellation(&MyCommand::new(1), &token)
        .await;

    assert_eq!(result, Err(DispatchError::Cancelled));
    assert!(h.outbox.is_empty());
    assert_eq!(h.producer.attempts(), 0);
}

#[tokio::test]
async fn store_failure_surfaces_as_outbox_error() {
    let h = harness(orders_producer());
    h.outbox.set_unavailable(true);

    let err = h.dispatcher.post_async(&MyCommand::new(1)).await.unwrap_err();

    assert!(matches!(err, DispatchError::Outbox(OutboxError::Storage(_))));
    assert!(err.is_transient());
    assert_eq!(h.producer.attempts(), 0);
}

#[tokio::test]
async fn producer_timeout_is_a_delivery_failure() {
    let policies = PolicyRegistry::with_defaults().with_policy(
        DEFAULT_OUTBOX_POLICY,
        ResiliencePolicy::new().with_timeout(Duration::from_millis(20)),
    );
    let producer = Arc::new(orders_producer().with_latency(Duration::from_secs(5)));
    let h = build(vec![producer], OutboxConfig::default(), policies);

    let err = h.dispatcher.post_async(&MyCommand::new(1)).await.unwrap_err();

    let DispatchError::Delivery(ProducerError::SendFailed { topic, reason }) = err else {
        panic!("expected a timed-out send, got {err:?}");
    };
    assert_eq!(topic.as_str(), "orders");
    assert_eq!(reason, "timed out after 20ms");
}

#[tokio::test]
async fn open_breaker_stops_producer_calls() {
    let policies = PolicyRegistry::with_defaults().with_policy(
        "outbox.guarded",
        ResiliencePolicy::new().with_circuit_breaker(
            CircuitBreakerConfig::builder()
                .failure_threshold(1)
                .timeout(Duration::from_secs(60))
                .build(),
        ),
    );
    let config = OutboxConfig::new().with_policy("outbox.guarded");
    let h = build(vec![Arc::new(orders_producer())], config, policies);
    h.producer.fail_always(true);

    let first = h.dispatcher.post_async(&MyCommand::new(1)).await.unwrap_err();
    let second = h.dispatcher.post_async(&MyCommand::new(2)).await.unwrap_err();

    assert!(matches!(first, DispatchError::Delivery(_)));
    assert_eq!(
        second,
        DispatchError::BrokenCircuit {
            policy: "outbox.guarded".to_string()
        }
    );
    assert_eq!(h.producer.attempts(), 1);
    assert_eq!(h.mediator.outstanding_count().await.unwrap(), 2);
}

// ============================================================================
// Deposit and clear
// ============================================================================

#[tokio::test]
async fn duplicate_deposit_is_a_no_op() {
    let h = harness(orders_producer());
    let command = MyCommand::new(1);

    let first = h.dispatcher.deposit_post_async(&command, None).await.unwrap();
    let second = h.dispatcher.deposit_post_async(&command, None).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.outbox.len(), 1);
    assert_eq!(h.observer.count("deposited"), 2);
    assert!(matches!(
        h.observer.events().last(),
        Some(DispatchEvent::Deposited {
            outcome: Outcome::Skipped,
            ..
        })
    ));
}

#[tokio::test]
async fn clearing_a_dispatched_message_sends_nothing() {
    let h = harness(orders_producer());
    let command = MyCommand::new(1);
    h.dispatcher.post_async(&command).await.unwrap();

    let outcomes = h
        .dispatcher
        .clear_outbox_async(&[message_id(&command)])
        .await
        .unwrap();

    assert_eq!(outcomes, vec![ClearOutcome::AlreadyDispatched]);
    assert_eq!(h.producer.attempts(), 1);
}

#[tokio::test]
async fn deposit_in_a_transaction_is_cleared_after_commit() {
    let h = harness(orders_producer());
    let command = MyCommand::new(1);
    let mut transaction = h.outbox.begin();

    let id = h
        .dispatcher
        .deposit_post_async(&command, Some(&mut transaction))
        .await
        .unwrap();
    assert!(h.outbox.is_empty(), "staged deposits are invisible");
    assert_eq!(transaction.len(), 1);

    assert_eq!(h.outbox.commit(transaction).unwrap(), 1);
    let outcomes = h.dispatcher.clear_outbox_async(&[id]).await.unwrap();

    assert_eq!(outcomes, vec![ClearOutcome::Dispatched]);
    assert!(h.outbox.is_dispatched(id));
    assert_eq!(h.producer.sent_ids(), vec![id]);
}

#[tokio::test]
async fn rolled_back_deposit_cannot_be_cleared() {
    let h = harness(orders_producer());
    let mut transaction = h.outbox.begin();
    let id = h
        .dispatcher
        .deposit_post_async(&MyCommand::new(1), Some(&mut transaction))
        .await
        .unwrap();

    transaction.rollback();
    let err = h.dispatcher.clear_outbox_async(&[id]).await.unwrap_err();

    assert_eq!(err, DispatchError::Outbox(OutboxError::NotFound(id)));
    assert_eq!(h.producer.attempts(), 0);
}

#[tokio::test]
async fn batch_deposit_shares_one_transaction() {
    let h = harness(orders_producer());
    let commands = [MyCommand::new(1), MyCommand::new(2), MyCommand::new(3)];
    let mut transaction = h.outbox.begin();

    let ids = h
        .dispatcher
        .deposit_post_batch_async(&commands, Some(&mut transaction))
        .await
        .unwrap();
    h.outbox.commit(transaction).unwrap();
    let outcomes = h.dispatcher.clear_outbox_async(&ids).await.unwrap();

    assert_eq!(ids, commands.iter().map(message_id).collect::<Vec<_>>());
    assert_eq!(outcomes, vec![ClearOutcome::Dispatched; 3]);
    assert_eq!(h.producer.sent_ids(), ids);
}

#[tokio::test]
async fn clear_tries_every_id_and_reports_the_first_failure() {
    let h = harness(orders_producer());
    let good = h.dispatcher.deposit_post_async(&MyCommand::new(1), None).await.unwrap();
    let missing = MessageId::new();
    let also_good = h.dispatcher.deposit_post_async(&MyCommand::new(2), None).await.unwrap();

    let err = h
        .dispatcher
        .clear_outbox_async(&[good, missing, also_good])
        .await
        .unwrap_err();

    assert_eq!(err, DispatchError::Outbox(OutboxError::NotFound(missing)));
    assert!(h.outbox.is_dispatched(good));
    assert!(h.outbox.is_dispatched(also_good));
}

#[tokio::test]
async fn concurrent_clears_of_one_id_send_once() {
    let producer = Arc::new(orders_producer().with_latency(Duration::from_millis(100)));
    let h = build(vec![producer], OutboxConfig::default(), fast_policies());
    let id = h.dispatcher.deposit_post_async(&MyCommand::new(1), None).await.unwrap();
    let context = RequestContext::new();

    let (first, second) = tokio::join!(h.mediator.clear_one(id, &context), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.mediator.clear_one(id, &context).await
    });

    assert_eq!(first, Ok(ClearOutcome::Dispatched));
    assert_eq!(second, Ok(ClearOutcome::AlreadyInFlight));
    assert_eq!(h.producer.attempts(), 1);
}

#[tokio::test]
async fn confirming_producer_waits_for_the_callback() {
    let h = harness(orders_producer().with_confirmation());
    let command = MyCommand::new(1);
    let id = message_id(&command);

    h.dispatcher.post_async(&command).await.unwrap();
    assert_eq!(h.producer.sent_ids(), vec![id]);
    assert!(!h.outbox.is_dispatched(id));

    assert_eq!(h.mediator.confirm_published(id, false).await, Ok(false));
    assert!(!h.outbox.is_dispatched(id));

    assert_eq!(h.mediator.confirm_published(id, true).await, Ok(true));
    assert!(h.outbox.is_dispatched(id));
    assert_eq!(h.mediator.confirm_published(id, true).await, Ok(false));
}

#[tokio::test]
async fn delayed_post_uses_the_producer_schedule() {
    let h = harness(orders_producer().with_delay_support());
    let command = MyCommand::new(1);

    h.dispatcher
        .post_with_delay_async(&command, Duration::from_secs(2))
        .await
        .unwrap();

    let id = message_id(&command);
    assert_eq!(h.producer.delays(), vec![(id, Duration::from_secs(2))]);
    assert_eq!(h.outbox.entry(id).unwrap().message.header().delay_ms(), 2000);
    assert!(h.outbox.is_dispatched(id));
}

#[tokio::test]
async fn delay_without_support_fails_once_and_stays_outstanding() {
    let h = harness(orders_producer());
    let command = MyCommand::new(1);

    let err = h
        .dispatcher
        .post_with_delay_async(&command, Duration::from_secs(2))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Delivery(ProducerError::DelayNotSupported(_))));
    assert_eq!(h.observer.count("clear_attempted"), 1);
    assert!(!h.outbox.is_dispatched(message_id(&command)));
}

#[tokio::test]
async fn unknown_topic_falls_back_to_the_request_type() {
    let h = harness(orders_producer());
    let message = Message::new(
        MessageHeader::new(MessageId::new(), "legacy-orders".into(), MessageType::Command)
            .with_type_name(std::any::type_name::<MyCommand>()),
        MessageBody::new(b"{}".to_vec(), "application/json"),
    );
    h.mediator.deposit(&message, None).await.unwrap();

    let outcome = h
        .mediator
        .clear_one(message.id(), &RequestContext::new())
        .await
        .unwrap();

    assert_eq!(outcome, ClearOutcome::Dispatched);
    assert_eq!(h.producer.sent_ids(), vec![message.id()]);
}

#[tokio::test]
async fn message_without_any_producer_is_undeliverable() {
    let h = harness(orders_producer());
    let message = Message::new(
        MessageHeader::new(MessageId::new(), "nowhere".into(), MessageType::Event),
        MessageBody::new(Vec::new(), "application/json"),
    );
    h.mediator.deposit(&message, None).await.unwrap();

    let err = h
        .mediator
        .clear_one(message.id(), &RequestContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Delivery(ProducerError::Unavailable(_))));
    assert!(!h.outbox.is_dispatched(message.id()));
}

// ============================================================================
// Backpressure
// ============================================================================

#[tokio::test]
async fn deposits_are_refused_at_the_ceiling() {
    let config = OutboxConfig::new().with_max_outstanding(2);
    let h = build(vec![Arc::new(orders_producer())], config, fast_policies());
    let first = h.dispatcher.deposit_post_async(&MyCommand::new(1), None).await.unwrap();
    h.dispatcher.deposit_post_async(&MyCommand::new(2), None).await.unwrap();

    let err = h
        .dispatcher
        .deposit_post_async(&MyCommand::new(3), None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        DispatchError::OutboxFull {
            outstanding: 2,
            limit: 2
        }
    );
    assert_eq!(h.outbox.len(), 2);

    h.dispatcher.clear_outbox_async(&[first]).await.unwrap();
    h.dispatcher.deposit_post_async(&MyCommand::new(3), None).await.unwrap();
    assert_eq!(h.outbox.len(), 3);
}

#[tokio::test]
async fn batch_larger_than_the_headroom_is_refused_whole() {
    let config = OutboxConfig::new().with_max_outstanding(2);
    let h = build(vec![Arc::new(orders_producer())], config, fast_policies());
    let commands = [MyCommand::new(1), MyCommand::new(2), MyCommand::new(3)];

    let err = h
        .dispatcher
        .deposit_post_batch_async(&commands, None)
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::OutboxFull { limit: 2, .. }));
    assert!(h.outbox.is_empty());
}

#[tokio::test]
async fn racing_deposits_cannot_overshoot_the_ceiling() {
    let store = LaggingOutbox {
        add_lag: Duration::from_millis(20),
        ..LaggingOutbox::default()
    };
    let mediator = lagging_mediator(
        store.clone(),
        Arc::new(orders_producer()),
        OutboxConfig::new().with_max_outstanding(1),
    );
    let messages: Vec<Message> = (0..5).map(|_| order_message()).collect();

    let results =
        futures::future::join_all(messages.iter().map(|message| mediator.deposit(message, None)))
            .await;

    let accepted = results.iter().filter(|result| matches!(result, Ok(true))).count();
    let refused = results
        .iter()
        .filter(|result| matches!(result, Err(DispatchError::OutboxFull { limit: 1, .. })))
        .count();
    assert_eq!((accepted, refused), (1, 4));
    assert_eq!(store.inner.len(), 1);
    assert_eq!(mediator.outstanding_estimate(), 1);
}

// ============================================================================
// Sweeping
// ============================================================================

#[tokio::test]
async fn sweep_honours_min_age_and_batch_size() {
    let h = harness(orders_producer());
    for value in 0..3 {
        h.dispatcher
            .deposit_post_async(&MyCommand::new(value), None)
            .await
            .unwrap();
    }
    let options = SweepOptions {
        min_age: Duration::from_secs(5),
        batch_size: 2,
        use_bulk: false,
    };

    let too_young = h.mediator.sweep(&options).await.unwrap();
    assert_eq!(too_young, SweepReport::default());

    h.clock.advance(chrono::TimeDelta::seconds(10));
    let first = h.mediator.sweep(&options).await.unwrap();
    let second = h.mediator.sweep(&options).await.unwrap();

    assert_eq!((first.attempted, first.dispatched), (2, 2));
    assert_eq!((second.attempted, second.dispatched), (1, 1));
    assert_eq!(h.mediator.outstanding_count().await.unwrap(), 0);
}

#[tokio::test]
async fn sweep_counts_failures_and_keeps_going() {
    let h = harness(orders_producer());
    for value in 0..2 {
        h.dispatcher
            .deposit_post_async(&MyCommand::new(value), None)
            .await
            .unwrap();
    }
    h.producer.fail_always(true);

    let report = h.mediator.sweep(&sweep_now(10)).await.unwrap();

    assert_eq!((report.attempted, report.failed, report.dispatched), (2, 2, 0));
    assert_eq!(h.producer.attempts(), 6);
    assert_eq!(h.observer.count("swept"), 1);
}

#[tokio::test]
async fn bulk_sweep_sends_one_batch_per_producer() {
    let orders = Arc::new(orders_producer());
    let events = Arc::new(events_producer());
    let h = build(
        vec![Arc::clone(&orders), Arc::clone(&events)],
        OutboxConfig::new().with_sweep_use_bulk(true).with_sweep_min_age(Duration::ZERO),
        fast_policies(),
    );
    h.dispatcher.deposit_post_async(&MyCommand::new(1), None).await.unwrap();
    h.dispatcher.deposit_post_async(&MyCommand::new(2), None).await.unwrap();
    h.dispatcher.deposit_post_async(&MyEvent::new(), None).await.unwrap();

    let report = h.mediator.sweep(&h.mediator.sweep_options()).await.unwrap();

    assert_eq!((report.attempted, report.dispatched, report.failed), (3, 3, 0));
    assert_eq!(orders.batches(), 1);
    assert_eq!(events.batches(), 1);
    assert_eq!(orders.sent().len(), 2);
    assert_eq!(events.sent().len(), 1);
    assert_eq!(h.mediator.outstanding_count().await.unwrap(), 0);
}

#[tokio::test]
async fn bulk_sweep_skips_an_entry_cleared_after_listing() {
    let store = LaggingOutbox {
        list_lag: Duration::from_millis(50),
        ..LaggingOutbox::default()
    };
    let producer = Arc::new(orders_producer());
    let mediator = lagging_mediator(store.clone(), producer.clone(), OutboxConfig::new());
    let message = order_message();
    mediator.deposit(&message, None).await.unwrap();
    let context = RequestContext::new();

    let options = bulk_sweep_now();
    let (report, cleared) = tokio::join!(mediator.sweep(&options), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        mediator.clear_one(message.id(), &context).await
    });

    let report = report.unwrap();
    assert_eq!(cleared, Ok(ClearOutcome::Dispatched));
    assert_eq!((report.attempted, report.dispatched, report.skipped), (1, 0, 1));
    assert_eq!(producer.sent_ids(), vec![message.id()]);
    assert_eq!(producer.batches(), 0);
}

#[tokio::test]
async fn bulk_sweep_counts_an_entry_confirmed_mid_send_as_skipped() {
    let producer = Arc::new(orders_producer().with_latency(Duration::from_millis(50)));
    let h = build(vec![producer], OutboxConfig::default(), fast_policies());
    let id = h.dispatcher.deposit_post_async(&MyCommand::new(1), None).await.unwrap();

    let options = bulk_sweep_now();
    let (report, confirmed) = tokio::join!(h.mediator.sweep(&options), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.mediator.confirm_published(id, true).await
    });

    let report = report.unwrap();
    assert_eq!(confirmed, Ok(true));
    assert_eq!((report.dispatched, report.skipped, report.failed), (0, 1, 0));
    assert_eq!(h.producer.batches(), 1);
    assert!(h.outbox.is_dispatched(id));
}

#[tokio::test]
async fn bulk_sweep_keeps_the_delivery_delay() {
    let h = harness(orders_producer().with_delay_support());
    let command = MyCommand::new(1);
    let id = message_id(&command);
    h.producer.fail_next(3);
    h.dispatcher
        .post_with_delay_async(&command, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(!h.outbox.is_dispatched(id));

    let report = h.mediator.sweep(&bulk_sweep_now()).await.unwrap();

    assert_eq!((report.attempted, report.dispatched, report.failed), (1, 1, 0));
    assert_eq!(h.producer.delays(), vec![(id, Duration::from_secs(2))]);
    assert_eq!(h.producer.batches(), 0);
    assert!(h.outbox.is_dispatched(id));
}

#[tokio::test]
async fn bulk_sweep_does_not_retry_a_missing_delay_capability() {
    let producer = Arc::new(DelaylessBatches {
        publication: Publication::new("orders").for_request::<MyCommand>(),
        batch_calls: AtomicUsize::new(0),
    });
    let mediator =
        lagging_mediator(LaggingOutbox::default(), producer.clone(), OutboxConfig::new());
    let message = order_message();
    mediator.deposit(&message, None).await.unwrap();

    let report = mediator.sweep(&bulk_sweep_now()).await.unwrap();

    assert_eq!((report.attempted, report.dispatched, report.failed), (1, 0, 1));
    assert_eq!(producer.batch_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timed_sweeper_delivers_until_cancelled() {
    let h = harness(orders_producer());
    h.producer.fail_always(true);
    let command = MyCommand::new(1);
    let _ = h.dispatcher.post_async(&command).await;
    h.producer.fail_always(false);

    let shutdown = CancellationToken::new();
    let sweeper = TimedOutboxSweeper::spawn(
        Arc::clone(&h.mediator),
        Duration::from_millis(10),
        sweep_now(10),
        shutdown.clone(),
    );

    let id = message_id(&command);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !h.outbox.is_dispatched(id) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    sweeper.await.unwrap();

    assert!(h.outbox.is_dispatched(id));
}

// ============================================================================
// Maintenance
// ============================================================================

#[tokio::test]
async fn dispatched_entries_can_be_listed_and_purged() {
    let h = harness(orders_producer());
    let start = h.clock.now();
    let command = MyCommand::new(1);
    h.dispatcher.post_async(&command).await.unwrap();
    let id = message_id(&command);

    let dispatched = h.mediator.dispatched_messages(start, 10).await.unwrap();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].message.id(), id);

    assert_eq!(h.mediator.purge(&[id]).await.unwrap(), 1);
    assert!(h.outbox.is_empty());
}

// ============================================================================
// Blocking facade
// ============================================================================

#[test]
fn blocking_post_runs_outside_a_runtime() {
    let h = harness(orders_producer());
    let command = MyCommand::new(1);

    h.dispatcher.post(&command).unwrap();

    assert!(h.outbox.is_dispatched(message_id(&command)));
}

#[test]
fn blocking_deposit_then_clear() {
    let h = harness(orders_producer());
    let mut transaction = h.outbox.begin();

    let id = h
        .dispatcher
        .deposit_post(&MyCommand::new(1), Some(&mut transaction))
        .unwrap();
    h.outbox.commit(transaction).unwrap();
    let outcomes = h.dispatcher.clear_outbox(&[id]).unwrap();

    assert_eq!(outcomes, vec![ClearOutcome::Dispatched]);
}

#[test]
fn blocking_post_from_worker_threads() {
    let h = Arc::new(harness(orders_producer()));
    let workers: Vec<_> = (0..4)
        .map(|value| {
            let h = Arc::clone(&h);
            std::thread::spawn(move || h.dispatcher.post(&MyCommand::new(value)))
        })
        .collect();

    for worker in workers {
        worker.join().unwrap().unwrap();
    }
    assert_eq!(h.producer.sent().len(), 4);
}
