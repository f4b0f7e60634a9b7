use std::{sync::Arc, time::Duration};

use rebound_common::{Destination, Message, MessageId, internal};
use rebound_redelivery::{NackCause, NackOutcome, RedeliveryError};

use super::{Broker, EntryState, SessionId};

/// A transacted consumer session.
///
/// Messages received are in flight until the session commits (acknowledging
/// them) or rolls back (handing them to the plugin chain).
#[derive(Debug)]
pub struct Session {
    broker: Arc<Broker>,
    id: SessionId,
    delivered: Vec<(Destination, MessageId)>,
}

impl Session {
    pub(super) const fn new(broker: Arc<Broker>, id: SessionId) -> Self {
        Self {
            broker,
            id,
            delivered: Vec::new(),
        }
    }

    /// Messages received since the last commit or rollback.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.delivered.len()
    }

    /// Wait up to `timeout` for a message on `destination`.
    pub async fn receive(&mut self, destination: &Destination, timeout: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let arrived = self.broker.arrivals().notified();

            if let Some(message) = self.broker.claim(destination, self.id) {
                self.delivered.push((destination.clone(), message.id));
                return Some(message);
            }

            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return None;
            }
        }
    }

    /// Acknowledge everything received in this transaction.
    ///
    /// # Errors
    /// If a plugin fails to process an acknowledgment
    pub async fn commit(&mut self) -> Result<(), RedeliveryError> {
        let plugins = self.broker.plugins();

        for (destination, id) in std::mem::take(&mut self.delivered) {
            self.broker.consume(&destination, id, self.id);
            plugins.on_acknowledge(&destination, id).await?;
        }

        Ok(())
    }

    /// Give back everything received in this transaction.
    ///
    /// # Errors
    /// The first plugin error; the messages it concerns stay in flight and
    /// are retried by the next rollback.
    pub async fn rollback(&mut self) -> Result<(), RedeliveryError> {
        self.negative_ack(NackCause::Rollback).await
    }

    /// Recover the session, giving back everything unacknowledged.
    ///
    /// # Errors
    /// As for [`Session::rollback`]
    pub async fn recover(&mut self) -> Result<(), RedeliveryError> {
        self.negative_ack(NackCause::Recover).await
    }

    async fn negative_ack(&mut self, cause: NackCause) -> Result<(), RedeliveryError> {
        let plugins = self.broker.plugins();
        let mut first_error = None;
        let mut unsettled = Vec::new();

        for (destination, id) in std::mem::take(&mut self.delivered) {
            let Some(message) = self.broker.in_flight(&destination, id, self.id) else {
                continue;
            };

            match plugins.on_negative_ack(&destination, &message, cause).await {
                Ok(NackOutcome::Handled) => {
                    self.broker
                        .settle(&destination, id, self.id, EntryState::Held);
                }
                Ok(NackOutcome::NotHandled) => {
                    self.broker
                        .settle(&destination, id, self.id, EntryState::Ready);
                }
                Err(err) => {
                    internal!(
                        level = WARN,
                        "Negative ack of {id} on {destination} failed, still in flight: {err}"
                    );
                    unsettled.push((destination, id));
                    first_error.get_or_insert(err);
                }
            }
        }

        self.delivered = unsettled;
        first_error.map_or(Ok(()), Err)
    }
}
