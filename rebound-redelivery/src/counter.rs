//! Per-message redelivery state
//!
//! Every method takes the map's entry lock for the duration of one
//! synchronous transition and returns a snapshot; no guard ever escapes, so
//! nothing here is held across an await.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use rebound_common::{Destination, JobId, Message, MessageId};

use crate::error::RedeliveryError;

/// Where a message is in the redelivery cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    /// Visible to consumers (or delivered to one).
    Dispatched,
    /// A negative acknowledgment is being decided.
    Holding,
    /// Waiting on a pending job.
    Scheduled(JobId),
    /// Being forwarded to a dead-letter destination.
    DeadLettering,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryState {
    pub message_id: MessageId,
    pub destination: Destination,
    pub redelivery_count: u32,
    pub current_delay_ms: u64,
    pub phase: DeliveryPhase,
}

/// The result of starting a negative-acknowledgment decision.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// The state before this attempt, used to revert on failure.
    pub previous: Option<DeliveryState>,
    pub current: DeliveryState,
}

/// Concurrent map of in-flight redelivery state, keyed by message identity.
#[derive(Debug, Clone, Default)]
pub struct DeliveryCounterStore {
    states: Arc<DashMap<MessageId, DeliveryState>>,
}

impl DeliveryCounterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a negative acknowledgment and move the message into `Holding`.
    ///
    /// State is created on first use, seeded from the count the message
    /// carries so that it survives restarts.
    ///
    /// # Errors
    /// [`RedeliveryError::DuplicateJob`] if the message already has a pending
    /// job, [`RedeliveryError::NotReady`] if another decision is in progress.
    pub fn begin_attempt(
        &self,
        message: &Message,
        destination: &Destination,
    ) -> Result<Attempt, RedeliveryError> {
        match self.states.entry(message.id) {
            Entry::Vacant(entry) => {
                let current = DeliveryState {
                    message_id: message.id,
                    destination: destination.clone(),
                    redelivery_count: message.redelivery_count.saturating_add(1),
                    current_delay_ms: 0,
                    phase: DeliveryPhase::Holding,
                };
                entry.insert(current.clone());
                Ok(Attempt {
                    previous: None,
                    current,
                })
            }
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                match state.phase {
                    DeliveryPhase::Scheduled(job) => Err(RedeliveryError::DuplicateJob(job)),
                    DeliveryPhase::Holding | DeliveryPhase::DeadLettering => {
                        Err(RedeliveryError::NotReady(message.id))
                    }
                    DeliveryPhase::Dispatched => {
                        let previous = state.clone();
                        state.redelivery_count = state.redelivery_count.saturating_add(1);
                        state.destination = destination.clone();
                        state.phase = DeliveryPhase::Holding;
                        Ok(Attempt {
                            previous: Some(previous),
                            current: state.clone(),
                        })
                    }
                }
            }
        }
    }

    /// Undo an attempt that could not be completed.
    pub fn revert(&self, attempt: Attempt) {
        match attempt.previous {
            Some(previous) => {
                self.states.insert(attempt.current.message_id, previous);
            }
            None => {
                self.states.remove(&attempt.current.message_id);
            }
        }
    }

    pub fn mark_scheduled(&self, id: MessageId, job: JobId, delay_ms: u64) {
        if let Some(mut state) = self.states.get_mut(&id) {
            state.phase = DeliveryPhase::Scheduled(job);
            state.current_delay_ms = delay_ms;
        }
    }

    pub fn mark_dead_lettering(&self, id: MessageId) {
        if let Some(mut state) = self.states.get_mut(&id) {
            state.phase = DeliveryPhase::DeadLettering;
        }
    }

    /// Claim a message for re-injection by a firing job.
    ///
    /// Moves the message to `Dispatched` before the dispatch happens, so a
    /// consumer that receives and rolls it back immediately is counted
    /// normally. Recreates state from the payload if the broker restarted.
    ///
    /// # Errors
    /// [`RedeliveryError::NotReady`] if a negative-acknowledgment decision is
    /// still in progress for the message.
    pub fn begin_reinject(
        &self,
        message: &Message,
        destination: &Destination,
    ) -> Result<Option<DeliveryState>, RedeliveryError> {
        self.transition_for_job(message, destination, DeliveryPhase::Dispatched)
    }

    /// Claim a message for a retried dead-letter transfer.
    ///
    /// # Errors
    /// [`RedeliveryError::NotReady`] if a decision is still in progress.
    pub fn begin_dead_letter_retry(
        &self,
        message: &Message,
        destination: &Destination,
    ) -> Result<Option<DeliveryState>, RedeliveryError> {
        self.transition_for_job(message, destination, DeliveryPhase::DeadLettering)
    }

    fn transition_for_job(
        &self,
        message: &Message,
        destination: &Destination,
        phase: DeliveryPhase,
    ) -> Result<Option<DeliveryState>, RedeliveryError> {
        match self.states.entry(message.id) {
            Entry::Vacant(entry) => {
                entry.insert(DeliveryState {
                    message_id: message.id,
                    destination: destination.clone(),
                    redelivery_count: message.redelivery_count,
                    current_delay_ms: 0,
                    phase,
                });
                Ok(None)
            }
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                if state.phase == DeliveryPhase::Holding {
                    return Err(RedeliveryError::NotReady(message.id));
                }
                let previous = state.clone();
                state.phase = phase;
                Ok(Some(previous))
            }
        }
    }

    /// Put back the state a job found before it tried (and failed) to fire.
    pub fn restore(&self, id: MessageId, previous: Option<DeliveryState>, job: JobId) {
        match previous {
            Some(previous) => {
                self.states.insert(id, previous);
            }
            None => {
                if let Some(mut state) = self.states.get_mut(&id) {
                    state.phase = DeliveryPhase::Scheduled(job);
                }
            }
        }
    }

    pub fn remove(&self, id: &MessageId) -> Option<DeliveryState> {
        self.states.remove(id).map(|(_, state)| state)
    }

    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<DeliveryState> {
        self.states.get(id).map(|state| state.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message::new(b"body".to_vec())
    }

    #[test]
    fn test_count_increments_once_per_attempt() {
        let store = DeliveryCounterStore::new();
        let message = message();
        let queue = Destination::queue("Orders");

        let first = store.begin_attempt(&message, &queue).expect("first attempt");
        assert_eq!(first.current.redelivery_count, 1);
        assert!(first.previous.is_none());

        store.mark_scheduled(message.id, JobId::for_message(message.id), 10);
        store
            .begin_reinject(&message, &queue)
            .expect("job can fire");

        let second = store.begin_attempt(&message, &queue).expect("second attempt");
        assert_eq!(second.current.redelivery_count, 2);
        assert_eq!(second.previous.map(|p| p.redelivery_count), Some(1));
    }

    #[test]
    fn test_count_is_seeded_from_message() {
        let store = DeliveryCounterStore::new();
        let mut message = message();
        message.redelivery_count = 4;

        let attempt = store
            .begin_attempt(&message, &Destination::queue("Orders"))
            .expect("attempt");
        assert_eq!(attempt.current.redelivery_count, 5);
    }

    #[test]
    fn test_pending_job_makes_attempt_a_duplicate() {
        let store = DeliveryCounterStore::new();
        let message = message();
        let queue = Destination::queue("Orders");
        let job = JobId::for_message(message.id);

        store.begin_attempt(&message, &queue).expect("attempt");
        store.mark_scheduled(message.id, job, 10);

        let duplicate = store.begin_attempt(&message, &queue);
        assert!(matches!(duplicate, Err(RedeliveryError::DuplicateJob(id)) if id == job));
        assert_eq!(store.get(&message.id).map(|s| s.redelivery_count), Some(1));
    }

    #[test]
    fn test_revert_restores_previous_state() {
        let store = DeliveryCounterStore::new();
        let message = message();
        let queue = Destination::queue("Orders");

        let attempt = store.begin_attempt(&message, &queue).expect("attempt");
        store.revert(attempt);
        assert!(store.is_empty());

        let attempt = store.begin_attempt(&message, &queue).expect("attempt");
        store.mark_scheduled(message.id, JobId::for_message(message.id), 10);
        store.begin_reinject(&message, &queue).expect("fire");
        let second = store.begin_attempt(&message, &queue).expect("attempt");
        store.revert(second);

        let state = store.get(&message.id).expect("state kept");
        assert_eq!(state.redelivery_count, attempt.current.redelivery_count);
        assert_eq!(state.phase, DeliveryPhase::Dispatched);
    }

    #[test]
    fn test_job_cannot_fire_while_holding() {
        let store = DeliveryCounterStore::new();
        let message = message();
        let queue = Destination::queue("Orders");

        store.begin_attempt(&message, &queue).expect("attempt");

        assert!(matches!(
            store.begin_reinject(&message, &queue),
            Err(RedeliveryError::NotReady(_))
        ));
    }

    #[test]
    fn test_reinject_after_restart_recreates_state() {
        let store = DeliveryCounterStore::new();
        let mut message = message();
        message.redelivery_count = 2;
        let queue = Destination::queue("Orders");

        let previous = store.begin_reinject(&message, &queue).expect("fire");
        assert!(previous.is_none());

        let state = store.get(&message.id).expect("state");
        assert_eq!(state.redelivery_count, 2);
        assert_eq!(state.phase, DeliveryPhase::Dispatched);
    }
}
