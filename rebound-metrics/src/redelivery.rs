//! Redelivery metrics
//!
//! Tracks the redelivery subsystem:
//! - Jobs scheduled and fired
//! - Messages dead-lettered, by cause
//! - Scheduling and routing failures
//! - Pending jobs (observable gauge)

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

use crate::MetricsError;

/// Redelivery metrics collector
#[derive(Debug)]
pub struct RedeliveryMetrics {
    scheduled_total: Counter<u64>,
    fired_total: Counter<u64>,
    dead_lettered_total: Counter<u64>,
    scheduling_failures_total: Counter<u64>,
    routing_failures_total: Counter<u64>,
    duplicate_jobs_total: Counter<u64>,
    delay_ms: Histogram<u64>,

    // Local mirrors, also read by the observable gauge callback
    pending: Arc<AtomicU64>,
    scheduled: AtomicU64,
    fired: AtomicU64,
    dead_lettered: AtomicU64,
}

impl RedeliveryMetrics {
    /// # Errors
    ///
    /// Returns an error if metric instruments cannot be created.
    pub fn new() -> Result<Self, MetricsError> {
        let meter = meter();

        let scheduled_total = meter
            .u64_counter("rebound.redelivery.scheduled.total")
            .with_description("Total number of redelivery jobs scheduled")
            .build();

        let fired_total = meter
            .u64_counter("rebound.redelivery.fired.total")
            .with_description("Total number of redelivery jobs fired")
            .build();

        let dead_lettered_total = meter
            .u64_counter("rebound.redelivery.dead_lettered.total")
            .with_description("Total number of messages routed to a dead-letter destination")
            .build();

        let scheduling_failures_total = meter
            .u64_counter("rebound.redelivery.scheduling.failures.total")
            .with_description("Total number of jobs that could not be persisted")
            .build();

        let routing_failures_total = meter
            .u64_counter("rebound.redelivery.routing.failures.total")
            .with_description("Total number of dead-letter transfers that failed")
            .build();

        let duplicate_jobs_total = meter
            .u64_counter("rebound.redelivery.duplicates.total")
            .with_description("Total number of duplicate jobs discarded")
            .build();

        let delay_ms = meter
            .u64_histogram("rebound.redelivery.delay.ms")
            .with_description("Distribution of computed redelivery delays")
            .build();

        let pending = Arc::new(AtomicU64::new(0));
        let observed = pending.clone();

        meter
            .u64_observable_gauge("rebound.redelivery.pending")
            .with_description("Jobs waiting to fire")
            .with_callback(move |observer| {
                observer.observe(observed.load(Ordering::Relaxed), &[]);
            })
            .build();

        Ok(Self {
            scheduled_total,
            fired_total,
            dead_lettered_total,
            scheduling_failures_total,
            routing_failures_total,
            duplicate_jobs_total,
            delay_ms,
            pending,
            scheduled: AtomicU64::new(0),
            fired: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        })
    }

    pub fn record_scheduled(&self, destination: &str, delay_ms: u64) {
        let attributes = [KeyValue::new("destination", destination.to_string())];
        self.scheduled_total.add(1, &attributes);
        self.delay_ms.record(delay_ms, &attributes);
        self.scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fired(&self, kind: &'static str) {
        self.fired_total.add(1, &[KeyValue::new("kind", kind)]);
        self.fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self, cause: &str) {
        self.dead_lettered_total
            .add(1, &[KeyValue::new("cause", cause.to_string())]);
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scheduling_failure(&self) {
        self.scheduling_failures_total.add(1, &[]);
    }

    pub fn record_routing_failure(&self) {
        self.routing_failures_total.add(1, &[]);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_jobs_total.add(1, &[]);
    }

    pub fn set_pending(&self, pending: u64) {
        self.pending.store(pending, Ordering::Relaxed);
    }

    #[must_use]
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }
}

fn meter() -> Meter {
    opentelemetry::global::meter("rebound.redelivery")
}
