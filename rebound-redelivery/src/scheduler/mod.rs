//! Durable delayed-job scheduler
//!
//! Jobs are persisted before [`RedeliveryScheduler::schedule`] returns and
//! removed from the store only after they have fired successfully. A tick
//! fires every job whose fire time has passed, earliest first, with insertion
//! order breaking ties.

mod index;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rebound_common::{Clock, JobId, JobKind, ScheduledJob, Signal, internal};
use rebound_store::JobStore;
use serde::Deserialize;

use self::index::PendingIndex;
use crate::error::{RedeliveryError, SchedulingError};

const fn default_tick_interval_ms() -> u64 {
    500
}

const fn default_persist_attempts() -> u32 {
    3
}

const fn default_persist_backoff_ms() -> u64 {
    50
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SchedulerConfig {
    /// How often due jobs are fired.
    ///
    /// Default: 500 ms
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Attempts made to persist a job before scheduling fails.
    ///
    /// Default: 3
    #[serde(default = "default_persist_attempts")]
    pub persist_attempts: u32,

    /// Linear backoff between persist attempts.
    ///
    /// Default: 50 ms
    #[serde(default = "default_persist_backoff_ms")]
    pub persist_backoff_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            persist_attempts: default_persist_attempts(),
            persist_backoff_ms: default_persist_backoff_ms(),
        }
    }
}

/// Performs the work of a due job.
///
/// An error leaves the job pending; it is offered again on the next tick.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn fire(&self, job: &ScheduledJob) -> Result<(), RedeliveryError>;
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fired: usize,
    pub failed: usize,
}

pub struct RedeliveryScheduler {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    index: Mutex<PendingIndex>,
    /// Serialises store writes so a delete can never overtake a newer put
    /// for the same id.
    write_gate: tokio::sync::Mutex<()>,
    sequence: AtomicU64,
    initialized: AtomicBool,
    accepting: AtomicBool,
}

impl std::fmt::Debug for RedeliveryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedeliveryScheduler")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("pending", &self.index.lock().len())
            .finish_non_exhaustive()
    }
}

impl RedeliveryScheduler {
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            store,
            clock,
            config,
            index: Mutex::new(PendingIndex::default()),
            write_gate: tokio::sync::Mutex::new(()),
            sequence: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Load every persisted job into the pending index.
    ///
    /// Jobs whose fire time already passed are fired on the first tick.
    /// Returns the number of jobs recovered.
    ///
    /// # Errors
    /// If the store cannot be scanned
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self))]
    pub async fn init(&self) -> Result<usize, SchedulingError> {
        internal!("Initialising redelivery scheduler ...");

        let jobs = self.store.scan_all().await.map_err(SchedulingError::Recovery)?;
        let recovered = jobs.len();

        {
            let mut index = self.index.lock();
            let mut next_sequence = 0;
            for job in jobs {
                next_sequence = next_sequence.max(job.sequence.saturating_add(1));
                index.insert(job);
            }
            self.sequence.fetch_max(next_sequence, Ordering::SeqCst);
            self.publish_pending(&index);
        }

        self.initialized.store(true, Ordering::SeqCst);

        if recovered > 0 {
            internal!(level = INFO, "Recovered {recovered} pending redelivery jobs");
        }

        Ok(recovered)
    }

    /// Persist and index a job.
    ///
    /// The job is durable when this returns `Ok`. The scheduler assigns the
    /// job's sequence number.
    ///
    /// # Errors
    /// [`RedeliveryError::DuplicateJob`] if a job with the same id is pending
    /// (the existing job is untouched), or a [`SchedulingError`] if the
    /// scheduler is not running or the job could not be persisted.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self, job), fields(id = %job.id, fire_at_ms = job.fire_at_ms))]
    pub async fn schedule(&self, mut job: ScheduledJob) -> Result<JobId, RedeliveryError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(SchedulingError::NotInitialized.into());
        }
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SchedulingError::ShuttingDown.into());
        }

        if !self.index.lock().reserve(job.id) {
            if let Some(metrics) = rebound_metrics::metrics() {
                metrics.redelivery.record_duplicate();
            }
            return Err(RedeliveryError::DuplicateJob(job.id));
        }

        job.sequence = self.sequence.fetch_add(1, Ordering::SeqCst);

        let _gate = self.write_gate.lock().await;

        if let Err(source) = self.persist(&job).await {
            let stale = {
                let mut index = self.index.lock();
                index.release(&job.id);
                !index.contains(&job.id) && !index.is_firing(&job.id)
            };

            // A copy left behind by a job that already finished is stale.
            if stale && let Err(err) = self.store.delete(&job.id).await {
                tracing::warn!(id = %job.id, "Failed to remove stale job after persist failure: {err}");
            }

            if let Some(metrics) = rebound_metrics::metrics() {
                metrics.redelivery.record_scheduling_failure();
            }

            return Err(SchedulingError::Persist {
                id: job.id,
                attempts: self.config.persist_attempts.max(1),
                source,
            }
            .into());
        }

        if let Some(metrics) = rebound_metrics::metrics() {
            metrics
                .redelivery
                .record_scheduled(&job.target.to_string(), job.delay_ms);
        }

        let id = job.id;
        let mut index = self.index.lock();
        index.insert(job);
        self.publish_pending(&index);

        Ok(id)
    }

    async fn persist(&self, job: &ScheduledJob) -> rebound_store::Result<()> {
        let attempts = self.config.persist_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.store.put(job).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < attempts => {
                    tracing::warn!(
                        id = %job.id,
                        attempt,
                        "Failed to persist job, retrying: {err}"
                    );
                    let backoff = self
                        .config
                        .persist_backoff_ms
                        .saturating_mul(u64::from(attempt));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Remove a pending job without firing it.
    ///
    /// Returns `true` if the job was pending or is firing right now. A firing
    /// job cannot be stopped; it is marked cancelled so its handler can check
    /// [`RedeliveryScheduler::is_cancelled`], and it is never re-queued.
    ///
    /// # Errors
    /// If the job could not be removed from the store
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self))]
    pub async fn cancel(&self, id: &JobId) -> Result<bool, RedeliveryError> {
        let (pending, firing) = {
            let mut index = self.index.lock();
            let pending = index.remove(id).is_some();
            let firing = index.cancel_firing(id);
            self.publish_pending(&index);
            (pending, firing)
        };

        if pending {
            self.delete_if_idle(id).await;
        }

        Ok(pending || firing)
    }

    /// Whether `id` was cancelled while firing.
    #[must_use]
    pub fn is_cancelled(&self, id: &JobId) -> bool {
        self.index.lock().is_cancelled(id)
    }

    /// Delete `id` from the store unless a newer job has taken its place.
    async fn delete_if_idle(&self, id: &JobId) {
        let _gate = self.write_gate.lock().await;

        {
            let index = self.index.lock();
            if index.contains(id) {
                return;
            }
        }

        if let Err(err) = self.store.delete(id).await {
            // Left in the store, it replays on restart and the handler
            // absorbs it as a duplicate.
            tracing::warn!(%id, "Failed to delete job from store: {err}");
        }
    }

    /// Fire every due job.
    ///
    /// Jobs are fired one at a time in `(fire_at_ms, sequence)` order. A job
    /// whose handler fails stays pending with its original fire time.
    pub async fn tick(&self, handler: &dyn JobHandler) -> TickReport {
        let now = self.clock.now_ms();
        let due = self.index.lock().take_due(now);

        let mut report = TickReport::default();
        let mut retry = Vec::new();

        for job in due {
            match handler.fire(&job).await {
                Ok(()) => {
                    report.fired += 1;

                    if let Some(metrics) = rebound_metrics::metrics() {
                        metrics.redelivery.record_fired(kind_label(&job.kind));
                    }

                    let _gate = self.write_gate.lock().await;
                    let idle = self.index.lock().finish(&job.id);
                    if idle && let Err(err) = self.store.delete(&job.id).await {
                        tracing::warn!(id = %job.id, "Failed to delete fired job: {err}");
                    }
                }
                Err(err) => {
                    report.failed += 1;

                    if err.is_not_ready() || err.is_duplicate() {
                        tracing::debug!(id = %job.id, "Job not ready to fire: {err}");
                    } else {
                        tracing::warn!(id = %job.id, "Job failed to fire, will retry: {err}");
                    }

                    retry.push(job);
                }
            }
        }

        let mut abandoned = Vec::new();
        {
            let mut index = self.index.lock();
            for job in retry {
                let cancelled = index.is_cancelled(&job.id);
                // A newer job for the same message supersedes this one.
                if index.finish(&job.id) {
                    if cancelled {
                        abandoned.push(job.id);
                    } else {
                        index.insert(job);
                    }
                }
            }
            self.publish_pending(&index);
        }

        for id in abandoned {
            self.delete_if_idle(&id).await;
        }

        report
    }

    /// Tick until shutdown is signalled, then persist and flush.
    ///
    /// # Errors
    /// If pending jobs could not be flushed on shutdown
    pub async fn serve(
        &self,
        handler: Arc<dyn JobHandler>,
        mut shutdown: tokio::sync::broadcast::Receiver<Signal>,
    ) -> Result<(), RedeliveryError> {
        internal!("Redelivery scheduler starting");

        let mut timer =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Skip the first tick to avoid immediate execution
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let report = self.tick(handler.as_ref()).await;
                    if report.fired > 0 || report.failed > 0 {
                        tracing::debug!(fired = report.fired, failed = report.failed, "Scheduler tick");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Redelivery scheduler received shutdown signal");
                        }
                        Err(e) => {
                            tracing::error!("Redelivery scheduler shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        self.shutdown().await?;
        internal!("Redelivery scheduler shutdown complete");

        Ok(())
    }

    /// Stop accepting jobs and make every pending job durable.
    ///
    /// Every job is attempted even when some fail, and the store is flushed
    /// either way.
    ///
    /// # Errors
    /// If any pending job could not be persisted, or the store could not be
    /// flushed
    pub async fn shutdown(&self) -> Result<(), RedeliveryError> {
        self.accepting.store(false, Ordering::SeqCst);

        let _gate = self.write_gate.lock().await;
        let pending: Vec<ScheduledJob> = self.index.lock().jobs().cloned().collect();

        let mut failed = 0;
        let mut first_error = None;
        for job in &pending {
            if let Err(err) = self.store.put(job).await {
                tracing::error!(id = %job.id, "Failed to persist job on shutdown: {err}");
                failed += 1;
                first_error.get_or_insert(err);
            }
        }

        self.store.flush().await.map_err(SchedulingError::Flush)?;

        if let Some(source) = first_error {
            return Err(SchedulingError::Unpersisted {
                failed,
                total: pending.len(),
                source,
            }
            .into());
        }

        internal!(
            level = INFO,
            "Persisted {} pending redelivery jobs",
            pending.len()
        );

        Ok(())
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.index.lock().len()
    }

    #[must_use]
    pub fn get(&self, id: &JobId) -> Option<ScheduledJob> {
        self.index.lock().get(id).cloned()
    }

    /// Fire time of the earliest pending job.
    #[must_use]
    pub fn next_fire_at(&self) -> Option<u64> {
        self.index.lock().next_fire_at()
    }

    #[allow(clippy::unused_self)]
    fn publish_pending(&self, index: &PendingIndex) {
        if let Some(metrics) = rebound_metrics::metrics() {
            metrics
                .redelivery
                .set_pending(u64::try_from(index.len()).unwrap_or(u64::MAX));
        }
    }
}

const fn kind_label(kind: &JobKind) -> &'static str {
    match kind {
        JobKind::Redelivery => "redelivery",
        JobKind::DeadLetter { .. } => "dead_letter",
    }
}
