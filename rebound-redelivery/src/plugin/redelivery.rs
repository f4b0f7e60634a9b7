//! The redelivery interceptor
//!
//! Decides, per negative acknowledgment, whether a message is redelivered
//! after a delay or dead-lettered, and performs the re-injection when the
//! scheduled job fires.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rebound_common::{Destination, JobId, JobKind, Message, MessageId, ScheduledJob, internal};

use super::{BrokerPlugin, NackCause, NackOutcome};
use crate::{
    broker::DestinationDispatcher,
    counter::{Attempt, DeliveryCounterStore},
    dead_letter::{DeadLetterCause, DeadLetterRouter},
    error::{RedeliveryError, RoutingError},
    policy::PolicyResolver,
    scheduler::{JobHandler, RedeliveryScheduler},
};

/// Property carrying the delay applied before a redelivery, in milliseconds.
pub const REDELIVERY_DELAY_PROPERTY: &str = "redeliveryDelay";

pub struct RedeliveryPlugin {
    policies: RwLock<PolicyResolver>,
    counters: DeliveryCounterStore,
    router: DeadLetterRouter,
    scheduler: Arc<RedeliveryScheduler>,
    dispatcher: Arc<dyn DestinationDispatcher>,
}

impl std::fmt::Debug for RedeliveryPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedeliveryPlugin")
            .field("router", &self.router)
            .field("scheduler", &self.scheduler)
            .field("tracked", &self.counters.len())
            .finish_non_exhaustive()
    }
}

impl RedeliveryPlugin {
    #[must_use]
    pub fn new(
        policies: PolicyResolver,
        router: DeadLetterRouter,
        scheduler: Arc<RedeliveryScheduler>,
        dispatcher: Arc<dyn DestinationDispatcher>,
    ) -> Self {
        Self {
            policies: RwLock::new(policies),
            counters: DeliveryCounterStore::new(),
            router,
            scheduler,
            dispatcher,
        }
    }

    /// Replace the policy maps.
    ///
    /// Only negative acknowledgments from now on see the new policies; jobs
    /// already scheduled keep the fire time they were given.
    pub fn update_policies(&self, policies: PolicyResolver) {
        *self.policies.write() = policies;
        internal!(level = INFO, "Redelivery policies updated");
    }

    #[must_use]
    pub const fn counters(&self) -> &DeliveryCounterStore {
        &self.counters
    }

    #[must_use]
    pub const fn router(&self) -> &DeadLetterRouter {
        &self.router
    }

    #[must_use]
    pub const fn scheduler(&self) -> &Arc<RedeliveryScheduler> {
        &self.scheduler
    }

    async fn redeliver(
        &self,
        attempt: Attempt,
        message: &Message,
        destination: &Destination,
        delay_ms: u64,
    ) -> Result<NackOutcome, RedeliveryError> {
        let count = attempt.current.redelivery_count;

        let mut payload = message.clone();
        payload.redelivered = true;
        payload.redelivery_count = count;
        payload.set_property(
            REDELIVERY_DELAY_PROPERTY,
            i64::try_from(delay_ms).unwrap_or(i64::MAX),
        );

        let job = ScheduledJob::redelivery(
            destination.clone(),
            payload,
            self.scheduler.now_ms(),
            delay_ms,
        );

        let job_id = match self.scheduler.schedule(job).await {
            Ok(id) => id,
            Err(RedeliveryError::DuplicateJob(existing)) => {
                tracing::warn!(id = %message.id, job = %existing, "Redelivery already pending, discarding duplicate");
                self.counters.revert(attempt);
                return Ok(NackOutcome::Handled);
            }
            Err(err) => {
                tracing::error!(
                    id = %message.id,
                    destination = %destination,
                    "Failed to schedule redelivery, leaving message in place: {err}"
                );
                self.counters.revert(attempt);
                return Err(err);
            }
        };

        if let Err(err) = self
            .dispatcher
            .remove_from_destination(destination, message.id)
            .await
        {
            tracing::error!(
                id = %message.id,
                destination = %destination,
                "Failed to hold message during redelivery delay: {err}"
            );
            if let Err(cancel_err) = self.scheduler.cancel(&job_id).await {
                tracing::warn!(job = %job_id, "Failed to cancel redelivery job: {cancel_err}");
            }
            self.counters.revert(attempt);
            return Err(err.into());
        }

        self.counters.mark_scheduled(message.id, job_id, delay_ms);

        internal!(
            level = DEBUG,
            "Redelivery {count} of {} from {destination} scheduled in {delay_ms}ms",
            message.id
        );

        Ok(NackOutcome::Handled)
    }

    async fn dead_letter(
        &self,
        attempt: Attempt,
        message: &Message,
        destination: &Destination,
        cause: DeadLetterCause,
    ) -> Result<NackOutcome, RedeliveryError> {
        self.counters.mark_dead_lettering(message.id);

        let mut payload = message.clone();
        payload.redelivered = true;
        payload.redelivery_count = attempt.current.redelivery_count;

        match self.router.route(&payload, destination, cause.as_str()).await {
            Ok(_) => {
                self.counters.remove(&message.id);
                if let Some(metrics) = rebound_metrics::metrics() {
                    metrics.redelivery.record_dead_lettered(cause.as_str());
                }
                Ok(NackOutcome::Handled)
            }
            Err(err @ RoutingError::Unavailable { .. }) => {
                tracing::warn!(
                    id = %message.id,
                    destination = %destination,
                    "Dead-letter routing failed, retrying on a later tick: {err}"
                );
                if let Some(metrics) = rebound_metrics::metrics() {
                    metrics.redelivery.record_routing_failure();
                }

                let retry = ScheduledJob::dead_letter(
                    destination.clone(),
                    payload,
                    cause.as_str(),
                    self.scheduler.now_ms(),
                );

                match self.scheduler.schedule(retry).await {
                    Ok(job_id) => {
                        self.counters.mark_scheduled(message.id, job_id, 0);
                        Ok(NackOutcome::Handled)
                    }
                    Err(err) => {
                        self.counters.revert(attempt);
                        Err(err)
                    }
                }
            }
            Err(err) => {
                self.counters.revert(attempt);
                Err(err.into())
            }
        }
    }

    async fn reinject(&self, job: &ScheduledJob) -> Result<(), RedeliveryError> {
        if self.scheduler.is_cancelled(&job.id) {
            internal!(
                level = DEBUG,
                "Dropping redelivery of removed message {}",
                job.payload.id
            );
            return Ok(());
        }

        let previous = self.counters.begin_reinject(&job.payload, &job.target)?;

        if let Err(err) = self
            .dispatcher
            .dispatch(&job.target, job.payload.clone())
            .await
        {
            self.counters.restore(job.payload.id, previous, job.id);
            return Err(err.into());
        }

        // Removed while the dispatch was in progress.
        if self.scheduler.is_cancelled(&job.id) {
            self.counters.remove(&job.payload.id);
            if let Err(err) = self
                .dispatcher
                .remove_from_destination(&job.target, job.payload.id)
                .await
            {
                tracing::error!(
                    id = %job.payload.id,
                    destination = %job.target,
                    "Failed to withdraw re-injected copy of a removed message: {err}"
                );
            }
            return Ok(());
        }

        internal!(
            level = DEBUG,
            "Re-injected {} into {} (redelivery {})",
            job.payload.id,
            job.target,
            job.attempt
        );

        Ok(())
    }

    async fn retry_dead_letter(&self, job: &ScheduledJob, cause: &str) -> Result<(), RedeliveryError> {
        if self.scheduler.is_cancelled(&job.id) {
            return Ok(());
        }

        let previous = self
            .counters
            .begin_dead_letter_retry(&job.payload, &job.target)?;

        match self.router.route(&job.payload, &job.target, cause).await {
            Ok(_) => {
                self.counters.remove(&job.payload.id);
                if let Some(metrics) = rebound_metrics::metrics() {
                    metrics.redelivery.record_dead_lettered(cause);
                }
                Ok(())
            }
            Err(err) => {
                if let Some(metrics) = rebound_metrics::metrics() {
                    metrics.redelivery.record_routing_failure();
                }
                self.counters.restore(job.payload.id, previous, job.id);
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl BrokerPlugin for RedeliveryPlugin {
    fn name(&self) -> &'static str {
        "redelivery"
    }

    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self, message), fields(id = %message.id))]
    async fn on_negative_ack(
        &self,
        destination: &Destination,
        message: &Message,
        cause: NackCause,
    ) -> Result<NackOutcome, RedeliveryError> {
        if self.router.is_dead_letter_destination(destination) {
            return Ok(NackOutcome::NotHandled);
        }

        let attempt = match self.counters.begin_attempt(message, destination) {
            Ok(attempt) => attempt,
            Err(RedeliveryError::DuplicateJob(job)) => {
                tracing::debug!(id = %message.id, %job, "Negative ack for message with a pending job, ignoring");
                if let Some(metrics) = rebound_metrics::metrics() {
                    metrics.redelivery.record_duplicate();
                }
                return Ok(NackOutcome::Handled);
            }
            Err(RedeliveryError::NotReady(id)) => {
                tracing::debug!(%id, "Negative ack while a decision is in progress, ignoring");
                return Ok(NackOutcome::Handled);
            }
            Err(err) => return Err(err),
        };

        let count = attempt.current.redelivery_count;
        let resolved = self.policies.read().resolve(destination);

        match resolved {
            Ok(policy) if policy.allows(count) => {
                let delay_ms = policy.delay_for(count);
                self.redeliver(attempt, message, destination, delay_ms).await
            }
            Ok(policy) => {
                internal!(
                    level = INFO,
                    "{} exceeded {} redeliveries from {destination} ({cause})",
                    message.id,
                    policy.maximum_redeliveries
                );
                self.dead_letter(
                    attempt,
                    message,
                    destination,
                    DeadLetterCause::MaximumRedeliveriesExceeded,
                )
                .await
            }
            Err(err) => {
                tracing::warn!(id = %message.id, "{err}, dead-lettering");
                self.dead_letter(attempt, message, destination, DeadLetterCause::NoPolicy)
                    .await
            }
        }
    }

    async fn on_acknowledge(
        &self,
        _destination: &Destination,
        id: MessageId,
    ) -> Result<(), RedeliveryError> {
        self.counters.remove(&id);
        Ok(())
    }

    async fn on_message_removed(
        &self,
        destination: &Destination,
        id: MessageId,
    ) -> Result<(), RedeliveryError> {
        self.counters.remove(&id);
        if self.scheduler.cancel(&JobId::for_message(id)).await? {
            internal!(level = DEBUG, "Cancelled pending job for removed message {id}");
        }

        // A job that fired just before the cancellation may already have
        // put the message back.
        if let Err(err) = self.dispatcher.remove_from_destination(destination, id).await {
            tracing::warn!(%id, %destination, "Failed to sweep removed message: {err}");
        }

        Ok(())
    }
}

#[async_trait]
impl JobHandler for RedeliveryPlugin {
    async fn fire(&self, job: &ScheduledJob) -> Result<(), RedeliveryError> {
        match &job.kind {
            JobKind::Redelivery => self.reinject(job).await,
            JobKind::DeadLetter { cause } => self.retry_dead_letter(job, cause).await,
        }
    }
}
