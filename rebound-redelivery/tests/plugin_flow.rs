//! Integration tests for the redelivery plugin
//!
//! These drive the plugin, scheduler and dead-letter router together against
//! an in-memory broker, with a manual clock so every tick is deterministic.
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::sync::{
    Arc, OnceLock, Weak,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use rebound_common::{
    Destination, JobId, JobKind, ManualClock, Message, MessageId, PropertyValue, ScheduledJob,
};
use rebound_redelivery::{
    BrokerError, BrokerPlugin, DeadLetterRouter, DeadLetterStrategy, DestinationDispatcher,
    JobHandler, NackCause, NackOutcome, PluginChain, PolicyResolver, REDELIVERY_DELAY_PROPERTY,
    RedeliveryError, RedeliveryPlugin, RedeliveryPolicy, RedeliveryPolicyMap, RedeliveryScheduler,
    SchedulerConfig, SchedulingError, policy::UNLIMITED_REDELIVERIES,
};
use rebound_store::TestJobStore;
use support::MockBroker;

const START_MS: u64 = 1_700_000_000_000;

struct Fixture {
    broker: Arc<MockBroker>,
    store: TestJobStore,
    clock: Arc<ManualClock>,
    scheduler: Arc<RedeliveryScheduler>,
    plugin: Arc<RedeliveryPlugin>,
}

impl Fixture {
    async fn new(queues: RedeliveryPolicyMap, strategy: DeadLetterStrategy) -> Self {
        let broker = MockBroker::new();
        let store = TestJobStore::new();
        let clock = Arc::new(ManualClock::new(START_MS));

        let scheduler = Arc::new(RedeliveryScheduler::new(
            Arc::new(store.clone()),
            clock.clone(),
            SchedulerConfig {
                persist_backoff_ms: 1,
                ..SchedulerConfig::default()
            },
        ));
        scheduler.init().await.expect("scheduler init");

        let plugin = Arc::new(RedeliveryPlugin::new(
            PolicyResolver::new(queues, RedeliveryPolicyMap::default()),
            DeadLetterRouter::new(strategy, broker.clone()),
            scheduler.clone(),
            broker.clone(),
        ));

        Self {
            broker,
            store,
            clock,
            scheduler,
            plugin,
        }
    }

    async fn nack(&self, destination: &Destination, message: &Message) -> NackOutcome {
        self.plugin
            .on_negative_ack(destination, message, NackCause::Rollback)
            .await
            .expect("negative ack")
    }

    async fn tick(&self) -> usize {
        self.scheduler.tick(self.plugin.as_ref()).await.fired
    }
}

fn redelivery_policy(maximum_redeliveries: i32, delay_ms: u64) -> RedeliveryPolicy {
    RedeliveryPolicy {
        initial_redelivery_delay_ms: delay_ms,
        redelivery_delay_ms: delay_ms,
        maximum_redeliveries,
        ..RedeliveryPolicy::default()
    }
}

fn single_policy(pattern: &str, policy: RedeliveryPolicy) -> RedeliveryPolicyMap {
    RedeliveryPolicyMap::empty()
        .with_entry(pattern, policy)
        .expect("valid pattern")
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Calls an unsupported method")]
async fn test_redelivered_twice_then_dead_lettered() {
    let fixture = Fixture::new(
        single_policy("Redelivery", redelivery_policy(2, 2000)),
        DeadLetterStrategy::shared(),
    )
    .await;
    let queue = Destination::queue("Redelivery");
    let dlq = Destination::queue("DLQ");

    let message = Message::new(b"payload".to_vec()).with_property("data", "hi");
    fixture.broker.put(&queue, message.clone());

    let mut delivered = message;
    for attempt in 1..=2_u32 {
        assert_eq!(fixture.nack(&queue, &delivered).await, NackOutcome::Handled);
        assert_eq!(fixture.broker.depth(&queue), 0, "hidden during the delay");
        assert_eq!(fixture.store.job_count(), 1);

        fixture.clock.advance(1_999);
        assert_eq!(fixture.tick().await, 0, "never fires early");
        assert_eq!(fixture.broker.depth(&queue), 0);

        fixture.clock.advance(1);
        assert_eq!(fixture.tick().await, 1);

        delivered = fixture.broker.messages(&queue).pop().expect("redelivered");
        assert_eq!(delivered.property("data"), Some(&PropertyValue::from("hi")));
        assert_eq!(
            delivered
                .property(REDELIVERY_DELAY_PROPERTY)
                .and_then(PropertyValue::as_long),
            Some(2000)
        );
        assert!(delivered.redelivered);
        assert_eq!(delivered.redelivery_count, attempt);
        assert_eq!(fixture.store.job_count(), 0);
    }

    assert_eq!(fixture.nack(&queue, &delivered).await, NackOutcome::Handled);

    assert_eq!(fixture.broker.depth(&queue), 0);
    let dead = fixture.broker.messages(&dlq);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, delivered.id);
    assert_eq!(dead[0].property("data"), Some(&PropertyValue::from("hi")));
    assert_eq!(
        dead[0].property("originalDestination"),
        Some(&PropertyValue::from("queue://Redelivery"))
    );
    assert!(fixture.plugin.counters().is_empty());
    assert_eq!(fixture.scheduler.pending(), 0);
}

#[tokio::test]
async fn test_exponential_back_off_delays() {
    let policy = RedeliveryPolicy {
        initial_redelivery_delay_ms: 100,
        redelivery_delay_ms: 100,
        use_exponential_back_off: true,
        back_off_multiplier: 2.0,
        maximum_redeliveries: 3,
        ..RedeliveryPolicy::default()
    };
    let fixture = Fixture::new(single_policy(">", policy), DeadLetterStrategy::shared()).await;
    let queue = Destination::queue("Orders");

    let mut delivered = Message::new(Vec::new());
    fixture.broker.put(&queue, delivered.clone());

    for expected in [100, 200, 400] {
        fixture.nack(&queue, &delivered).await;
        let job = fixture
            .scheduler
            .get(&JobId::for_message(delivered.id))
            .expect("pending");
        assert_eq!(job.delay_ms, expected);

        fixture.clock.advance(expected);
        fixture.tick().await;
        delivered = fixture.broker.messages(&queue).pop().expect("redelivered");
    }
}

#[tokio::test]
async fn test_duplicate_negative_ack_is_absorbed() {
    let fixture = Fixture::new(
        single_policy("Orders", redelivery_policy(5, 500)),
        DeadLetterStrategy::shared(),
    )
    .await;
    let queue = Destination::queue("Orders");
    let message = Message::new(Vec::new());
    fixture.broker.put(&queue, message.clone());

    assert_eq!(fixture.nack(&queue, &message).await, NackOutcome::Handled);
    assert_eq!(fixture.nack(&queue, &message).await, NackOutcome::Handled);

    assert_eq!(fixture.scheduler.pending(), 1);
    assert_eq!(fixture.store.successful_puts(), 1);
    assert_eq!(
        fixture
            .plugin
            .counters()
            .get(&message.id)
            .map(|state| state.redelivery_count),
        Some(1)
    );
}

#[tokio::test]
async fn test_firing_twice_reinjects_once() {
    let fixture = Fixture::new(
        single_policy("Orders", redelivery_policy(5, 0)),
        DeadLetterStrategy::shared(),
    )
    .await;
    let queue = Destination::queue("Orders");
    let message = Message::new(Vec::new());
    fixture.broker.put(&queue, message.clone());

    fixture.nack(&queue, &message).await;
    let job = fixture
        .scheduler
        .get(&JobId::for_message(message.id))
        .expect("pending");

    fixture.plugin.fire(&job).await.expect("first fire");
    fixture.plugin.fire(&job).await.expect("second fire");

    assert_eq!(fixture.broker.depth(&queue), 1);
}

#[tokio::test]
async fn test_zero_delay_fires_on_next_tick() {
    let fixture = Fixture::new(
        single_policy("Orders", redelivery_policy(5, 0)),
        DeadLetterStrategy::shared(),
    )
    .await;
    let queue = Destination::queue("Orders");
    let message = Message::new(Vec::new());
    fixture.broker.put(&queue, message.clone());

    fixture.nack(&queue, &message).await;
    assert_eq!(fixture.broker.depth(&queue), 0);

    assert_eq!(fixture.tick().await, 1);
    assert_eq!(fixture.broker.depth(&queue), 1);
}

#[tokio::test]
async fn test_scheduling_failure_leaves_message_in_place() {
    let fixture = Fixture::new(
        single_policy("Orders", redelivery_policy(5, 500)),
        DeadLetterStrategy::shared(),
    )
    .await;
    let queue = Destination::queue("Orders");
    let message = Message::new(Vec::new());
    fixture.broker.put(&queue, message.clone());

    fixture.store.fail_next_puts(3);
    let result = fixture
        .plugin
        .on_negative_ack(&queue, &message, NackCause::Rollback)
        .await;

    assert!(matches!(
        result,
        Err(RedeliveryError::Scheduling(SchedulingError::Persist { .. }))
    ));
    assert_eq!(fixture.broker.depth(&queue), 1);
    assert!(fixture.plugin.counters().is_empty());

    assert_eq!(fixture.nack(&queue, &message).await, NackOutcome::Handled);
    assert_eq!(
        fixture
            .plugin
            .counters()
            .get(&message.id)
            .map(|state| state.redelivery_count),
        Some(1)
    );
}

#[tokio::test]
async fn test_unavailable_dead_letter_queue_is_retried() {
    let fixture = Fixture::new(
        single_policy("Orders", RedeliveryPolicy::no_redelivery()),
        DeadLetterStrategy::shared(),
    )
    .await;
    let queue = Destination::queue("Orders");
    let dlq = Destination::queue("DLQ");
    let message = Message::new(Vec::new());
    fixture.broker.put(&queue, message.clone());
    fixture.broker.set_unavailable(&dlq, true);

    assert_eq!(fixture.nack(&queue, &message).await, NackOutcome::Handled);
    assert_eq!(fixture.broker.depth(&queue), 1, "never deleted before the DLQ write");

    let job = fixture
        .scheduler
        .get(&JobId::for_message(message.id))
        .expect("retry pending");
    assert!(matches!(job.kind, JobKind::DeadLetter { .. }));

    assert_eq!(fixture.tick().await, 0);
    assert_eq!(fixture.scheduler.pending(), 1);

    fixture.broker.set_unavailable(&dlq, false);
    fixture.clock.advance(1);
    assert_eq!(fixture.tick().await, 1);

    assert_eq!(fixture.broker.depth(&queue), 0);
    assert_eq!(fixture.broker.depth(&dlq), 1);
    assert!(fixture.plugin.counters().is_empty());
    assert_eq!(fixture.store.job_count(), 0);
}

#[tokio::test]
async fn test_missing_policy_dead_letters_immediately() {
    let fixture = Fixture::new(RedeliveryPolicyMap::empty(), DeadLetterStrategy::shared()).await;
    let queue = Destination::queue("Orders");
    let message = Message::new(Vec::new());
    fixture.broker.put(&queue, message.clone());

    assert_eq!(fixture.nack(&queue, &message).await, NackOutcome::Handled);

    let dead = fixture.broker.messages(&Destination::queue("DLQ"));
    assert_eq!(dead.len(), 1);
    assert_eq!(
        dead[0].property("deadLetterCause"),
        Some(&PropertyValue::from("no redelivery policy"))
    );
}

#[tokio::test]
async fn test_individual_and_shared_strategies() {
    let queue = Destination::queue("Orders");

    let individual = Fixture::new(
        single_policy("Orders", RedeliveryPolicy::no_redelivery()),
        DeadLetterStrategy::individual(),
    )
    .await;
    let message = Message::new(Vec::new());
    individual.broker.put(&queue, message.clone());
    individual.nack(&queue, &message).await;

    assert_eq!(individual.broker.depth(&Destination::queue("DLQ.Queue.Orders")), 1);
    assert_eq!(individual.broker.depth(&Destination::queue("DLQ")), 0);
    assert_eq!(individual.broker.total(), 1);

    let shared = Fixture::new(
        single_policy("Orders", RedeliveryPolicy::no_redelivery()),
        DeadLetterStrategy::shared(),
    )
    .await;
    let message = Message::new(Vec::new());
    shared.broker.put(&queue, message.clone());
    shared.nack(&queue, &message).await;

    assert_eq!(shared.broker.depth(&Destination::queue("DLQ")), 1);
    assert_eq!(shared.broker.depth(&Destination::queue("DLQ.Queue.Orders")), 0);
    assert_eq!(shared.broker.total(), 1);
}

#[tokio::test]
async fn test_negative_ack_on_dead_letter_queue_is_passed_on() {
    let fixture = Fixture::new(RedeliveryPolicyMap::default(), DeadLetterStrategy::shared()).await;
    let dlq = Destination::queue("DLQ");
    let message = Message::new(Vec::new());
    fixture.broker.put(&dlq, message.clone());

    assert_eq!(fixture.nack(&dlq, &message).await, NackOutcome::NotHandled);
    assert_eq!(fixture.broker.depth(&dlq), 1);
    assert_eq!(fixture.scheduler.pending(), 0);
}

#[tokio::test]
async fn test_removed_message_cancels_job() {
    let fixture = Fixture::new(
        single_policy("Orders", redelivery_policy(5, 500)),
        DeadLetterStrategy::shared(),
    )
    .await;
    let queue = Destination::queue("Orders");
    let message = Message::new(Vec::new());
    fixture.broker.put(&queue, message.clone());

    fixture.nack(&queue, &message).await;
    fixture
        .plugin
        .on_message_removed(&queue, message.id)
        .await
        .expect("removal");

    assert_eq!(fixture.scheduler.pending(), 0);
    assert_eq!(fixture.store.job_count(), 0);
    assert!(fixture.plugin.counters().is_empty());

    fixture.clock.advance(500);
    assert_eq!(fixture.tick().await, 0);
    assert_eq!(fixture.broker.total(), 0);
}

/// Forwards to a [`MockBroker`], but removes the message administratively
/// just before the first dispatch goes through.
struct RemovingDispatcher {
    broker: Arc<MockBroker>,
    plugin: OnceLock<Weak<RedeliveryPlugin>>,
    armed: AtomicBool,
}

#[async_trait]
impl DestinationDispatcher for RemovingDispatcher {
    async fn dispatch(
        &self,
        destination: &Destination,
        message: Message,
    ) -> Result<(), BrokerError> {
        if self.armed.swap(false, Ordering::SeqCst)
            && let Some(plugin) = self.plugin.get().and_then(Weak::upgrade)
        {
            plugin
                .on_message_removed(destination, message.id)
                .await
                .map_err(|err| BrokerError::Internal(err.to_string()))?;
        }
        self.broker.dispatch(destination, message).await
    }

    async fn remove_from_destination(
        &self,
        destination: &Destination,
        id: MessageId,
    ) -> Result<bool, BrokerError> {
        self.broker.remove_from_destination(destination, id).await
    }
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Calls an unsupported method")]
async fn test_removal_during_reinjection_withdraws_message() {
    let broker = MockBroker::new();
    let store = TestJobStore::new();
    let clock = Arc::new(ManualClock::new(START_MS));
    let scheduler = Arc::new(RedeliveryScheduler::new(
        Arc::new(store.clone()),
        clock.clone(),
        SchedulerConfig::default(),
    ));
    scheduler.init().await.expect("scheduler init");

    let dispatcher = Arc::new(RemovingDispatcher {
        broker: broker.clone(),
        plugin: OnceLock::new(),
        armed: AtomicBool::new(true),
    });
    let plugin = Arc::new(RedeliveryPlugin::new(
        PolicyResolver::new(
            single_policy("Orders", redelivery_policy(5, 500)),
            RedeliveryPolicyMap::default(),
        ),
        DeadLetterRouter::new(DeadLetterStrategy::shared(), broker.clone()),
        scheduler.clone(),
        dispatcher.clone(),
    ));
    dispatcher
        .plugin
        .set(Arc::downgrade(&plugin))
        .expect("plugin set once");

    let queue = Destination::queue("Orders");
    let message = Message::new(Vec::new());
    broker.put(&queue, message.clone());

    plugin
        .on_negative_ack(&queue, &message, NackCause::Rollback)
        .await
        .expect("negative ack");

    clock.advance(500);
    let report = scheduler.tick(plugin.as_ref()).await;
    assert_eq!(report.fired, 1);

    assert_eq!(broker.depth(&queue), 0, "removed message came back");
    assert!(plugin.counters().is_empty());
    assert_eq!(scheduler.pending(), 0);
    assert_eq!(store.job_count(), 0);
}

#[tokio::test]
#[cfg_attr(miri, ignore = "Calls an unsupported method")]
async fn test_removal_after_job_is_due_skips_reinjection() {
    struct RemoveThenFire {
        plugin: Arc<RedeliveryPlugin>,
        destination: Destination,
    }

    #[async_trait]
    impl JobHandler for RemoveThenFire {
        async fn fire(&self, job: &ScheduledJob) -> Result<(), RedeliveryError> {
            self.plugin
                .on_message_removed(&self.destination, job.payload.id)
                .await?;
            self.plugin.fire(job).await
        }
    }

    let fixture = Fixture::new(
        single_policy("Orders", redelivery_policy(5, 500)),
        DeadLetterStrategy::shared(),
    )
    .await;
    let queue = Destination::queue("Orders");
    let message = Message::new(Vec::new());
    fixture.broker.put(&queue, message.clone());

    fixture.nack(&queue, &message).await;

    let handler = RemoveThenFire {
        plugin: fixture.plugin.clone(),
        destination: queue.clone(),
    };
    fixture.clock.advance(500);
    assert_eq!(fixture.scheduler.tick(&handler).await.fired, 1);

    assert_eq!(fixture.broker.dispatch_count(), 0);
    assert_eq!(fixture.broker.total(), 0);
    assert!(fixture.plugin.counters().is_empty());
    assert_eq!(fixture.store.job_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[cfg_attr(miri, ignore = "Calls an unsupported method")]
async fn test_concurrent_negative_ack_and_tick_count_once() {
    const ROUNDS: u32 = 50;

    let fixture = Fixture::new(
        single_policy("Orders", redelivery_policy(UNLIMITED_REDELIVERIES, 0)),
        DeadLetterStrategy::shared(),
    )
    .await;
    let queue = Destination::queue("Orders");
    let message = Message::new(Vec::new());
    fixture.broker.put(&queue, message.clone());

    let mut delivered = message;
    for round in 1..=ROUNDS {
        let nack = {
            let plugin = fixture.plugin.clone();
            let queue = queue.clone();
            let delivered = delivered.clone();
            tokio::spawn(async move {
                plugin
                    .on_negative_ack(&queue, &delivered, NackCause::Rollback)
                    .await
            })
        };
        let tick = {
            let plugin = fixture.plugin.clone();
            let scheduler = fixture.scheduler.clone();
            tokio::spawn(async move { scheduler.tick(plugin.as_ref()).await })
        };

        let (nacked, _) = tokio::join!(nack, tick);
        assert_eq!(
            nacked.expect("nack task").expect("negative ack"),
            NackOutcome::Handled
        );

        for _ in 0..10 {
            if fixture.scheduler.pending() == 0 {
                break;
            }
            fixture.tick().await;
        }
        assert_eq!(fixture.scheduler.pending(), 0, "round {round} never fired");

        let copies = fixture.broker.messages(&queue);
        assert_eq!(copies.len(), 1, "round {round}");
        delivered = copies[0].clone();
        assert_eq!(delivered.redelivery_count, round);
        assert_eq!(
            fixture
                .plugin
                .counters()
                .get(&delivered.id)
                .map(|state| state.redelivery_count),
            Some(round)
        );
    }

    assert_eq!(fixture.broker.dispatch_count(), ROUNDS as usize);
    assert_eq!(fixture.store.job_count(), 0);
}

#[tokio::test]
async fn test_acknowledge_clears_state() {
    let fixture = Fixture::new(
        single_policy("Orders", redelivery_policy(5, 0)),
        DeadLetterStrategy::shared(),
    )
    .await;
    let queue = Destination::queue("Orders");
    let message = Message::new(Vec::new());
    fixture.broker.put(&queue, message.clone());

    fixture.nack(&queue, &message).await;
    fixture.tick().await;
    assert_eq!(fixture.plugin.counters().len(), 1);

    fixture
        .plugin
        .on_acknowledge(&queue, message.id)
        .await
        .expect("ack");
    assert!(fixture.plugin.counters().is_empty());
}

#[tokio::test]
async fn test_policy_update_applies_to_new_negative_acks_only() {
    let fixture = Fixture::new(
        single_policy("Orders", redelivery_policy(5, 1_000)),
        DeadLetterStrategy::shared(),
    )
    .await;
    let queue = Destination::queue("Orders");
    let first = Message::new(Vec::new());
    let second = Message::new(Vec::new());
    fixture.broker.put(&queue, first.clone());
    fixture.broker.put(&queue, second.clone());

    fixture.nack(&queue, &first).await;
    fixture.plugin.update_policies(PolicyResolver::new(
        single_policy("Orders", redelivery_policy(5, 10_000)),
        RedeliveryPolicyMap::default(),
    ));
    fixture.nack(&queue, &second).await;

    let fire_at = |message: &Message| {
        fixture
            .scheduler
            .get(&JobId::for_message(message.id))
            .map(|job| job.fire_at_ms)
    };
    assert_eq!(fire_at(&first), Some(START_MS + 1_000));
    assert_eq!(fire_at(&second), Some(START_MS + 10_000));
}

#[tokio::test]
async fn test_chain_falls_through_to_broker_default() {
    let fixture = Fixture::new(RedeliveryPolicyMap::default(), DeadLetterStrategy::shared()).await;
    let chain = PluginChain::new().with(fixture.plugin.clone());
    let dlq = Destination::queue("DLQ");

    let outcome = chain
        .on_negative_ack(&dlq, &Message::new(Vec::new()), NackCause::Recover)
        .await
        .expect("chain");
    assert_eq!(outcome, NackOutcome::NotHandled);

    let outcome = chain
        .on_negative_ack(
            &Destination::queue("Orders"),
            &Message::new(Vec::new()),
            NackCause::Expired,
        )
        .await
        .expect("chain");
    assert_eq!(outcome, NackOutcome::Handled);
}
