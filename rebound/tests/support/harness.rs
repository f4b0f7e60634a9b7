//! End-to-end test harness for the embedded broker
//!
//! This module starts a broker with the redelivery plugin installed and the
//! scheduler loop running in the background. The scheduler's clock follows
//! tokio's clock, so tests run with `start_paused = true` and simulated
//! waits complete instantly.
//!
//! # Example
//!
//! ```no_run
//! use support::harness::E2ETestHarness;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_redelivery() {
//!     let harness = E2ETestHarness::builder()
//!         .with_policy("Orders", RedeliveryPolicy::default())
//!         .build()
//!         .await;
//!
//!     let mut session = harness.session();
//!     // send, receive, rollback ...
//!
//!     harness.shutdown().await;
//! }
//! ```
#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::sync::Arc;

use rebound::{Broker, Rebound, Service, Session};
use rebound_common::{Clock, Signal};
use rebound_metrics::MetricsConfig;
use rebound_redelivery::{
    DeadLetterStrategy, RedeliveryConfig, RedeliveryPolicy, RedeliveryPolicyMap, SchedulerConfig,
};
use rebound_store::{JobStore, MemoryJobStore, StoreConfig};
use tokio::{sync::broadcast, task::JoinHandle};

/// Wall-clock milliseconds at which every harness clock starts
pub const EPOCH_MS: u64 = 1_700_000_000_000;

/// A [`Clock`] that follows tokio's (pausable) clock
#[derive(Debug)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: tokio::time::Instant::now(),
        })
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        EPOCH_MS.saturating_add(elapsed)
    }
}

pub struct E2ETestHarness {
    service: Arc<Service>,
    store: Arc<dyn JobStore>,
    clock: Arc<TokioClock>,
    shutdown: broadcast::Sender<Signal>,
    scheduler_handle: JoinHandle<()>,
}

pub struct E2ETestHarnessBuilder {
    queue_policies: RedeliveryPolicyMap,
    dead_letter: DeadLetterStrategy,
    tick_interval_ms: u64,
    store: Option<Arc<dyn JobStore>>,
    clock: Option<Arc<TokioClock>>,
}

impl E2ETestHarness {
    pub fn builder() -> E2ETestHarnessBuilder {
        E2ETestHarnessBuilder {
            queue_policies: RedeliveryPolicyMap::empty(),
            dead_letter: DeadLetterStrategy::shared(),
            tick_interval_ms: 500,
            store: None,
            clock: None,
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        self.service.broker()
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn session(&self) -> Session {
        self.service.broker().create_session()
    }

    /// The job store, for handing to a restarted harness
    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn clock(&self) -> Arc<TokioClock> {
        self.clock.clone()
    }

    /// Signal shutdown and wait for the scheduler to flush
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(Signal::Shutdown);
        self.scheduler_handle.await.expect("scheduler task");
    }
}

impl E2ETestHarnessBuilder {
    pub fn with_policy(mut self, pattern: &str, policy: RedeliveryPolicy) -> Self {
        self.queue_policies
            .insert(pattern, policy)
            .expect("valid pattern");
        self
    }

    pub fn with_default_policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.queue_policies.set_default_entry(Some(policy));
        self
    }

    pub fn with_dead_letter_strategy(mut self, strategy: DeadLetterStrategy) -> Self {
        self.dead_letter = strategy;
        self
    }

    pub const fn with_tick_interval_ms(mut self, tick_interval_ms: u64) -> Self {
        self.tick_interval_ms = tick_interval_ms;
        self
    }

    /// Reuse the store and clock of a previous harness, as after a restart
    pub fn restarted_from(mut self, store: Arc<dyn JobStore>, clock: Arc<TokioClock>) -> Self {
        self.store = Some(store);
        self.clock = Some(clock);
        self
    }

    pub async fn build(self) -> E2ETestHarness {
        let config = Rebound {
            redelivery: RedeliveryConfig {
                queue_policies: self.queue_policies,
                topic_policies: RedeliveryPolicyMap::default(),
                dead_letter: self.dead_letter,
                scheduler: SchedulerConfig {
                    tick_interval_ms: self.tick_interval_ms,
                    ..SchedulerConfig::default()
                },
            },
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
        };

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryJobStore::new()));
        let clock = self.clock.unwrap_or_else(TokioClock::new);

        let service = Arc::new(
            config
                .build_with(store.clone(), clock.clone())
                .await
                .expect("Failed to build broker"),
        );

        let (shutdown, receiver) = broadcast::channel(4);
        let scheduler_handle = {
            let service = service.clone();
            tokio::spawn(async move {
                service.serve(receiver).await.expect("scheduler flush");
            })
        };

        E2ETestHarness {
            service,
            store,
            clock,
            shutdown,
            scheduler_handle,
        }
    }
}
