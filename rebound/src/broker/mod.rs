//! Embedded in-memory broker
//!
//! Hosts the plugin chain and provides the collaborator interfaces the
//! redelivery subsystem consumes. Every destination is an ordered list of
//! entries; an entry is either ready for a consumer, in flight to one
//! session, or held by a plugin that took ownership of it.

mod session;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rebound_common::{Destination, Message, MessageId, internal};
use rebound_redelivery::{
    BrokerError, DestinationDispatcher, PluginChain, RedeliveryError, UnitOfWork,
};
pub use session::Session;
use tokio::sync::Notify;

pub(crate) type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    Ready,
    InFlight(SessionId),
    Held,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    state: EntryState,
}

#[derive(Debug, Default)]
pub struct Broker {
    destinations: Mutex<HashMap<Destination, Vec<Entry>>>,
    unavailable: Mutex<HashSet<Destination>>,
    plugins: RwLock<PluginChain>,
    arrivals: Notify,
    next_session: AtomicU64,
}

impl Broker {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Replace the installed plugin chain.
    pub fn install_plugins(&self, chain: PluginChain) {
        internal!(level = INFO, "Broker plugins installed: {chain:?}");
        *self.plugins.write() = chain;
    }

    pub fn clear_plugins(&self) {
        *self.plugins.write() = PluginChain::new();
    }

    pub(crate) fn plugins(&self) -> PluginChain {
        self.plugins.read().clone()
    }

    /// Mark a destination as (un)able to accept writes.
    pub fn set_available(&self, destination: &Destination, available: bool) {
        let mut unavailable = self.unavailable.lock();
        if available {
            unavailable.remove(destination);
        } else {
            unavailable.insert(destination.clone());
        }
    }

    fn check_available(&self, destination: &Destination) -> Result<(), BrokerError> {
        if self.unavailable.lock().contains(destination) {
            return Err(BrokerError::DestinationUnavailable(destination.to_string()));
        }
        Ok(())
    }

    /// Produce a message to a destination.
    ///
    /// # Errors
    /// If a plugin rejects the message or the destination is unavailable
    pub async fn send(
        &self,
        destination: &Destination,
        message: Message,
    ) -> Result<MessageId, RedeliveryError> {
        self.check_available(destination)?;

        let message = self.plugins().on_send(destination, message).await?;
        let id = message.id;

        self.enqueue(destination, message);
        Ok(id)
    }

    /// Open a transacted consumer session.
    #[must_use]
    pub fn create_session(self: &Arc<Self>) -> Session {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        Session::new(Arc::clone(self), id)
    }

    /// Administratively delete a message, whatever state it is in.
    ///
    /// # Errors
    /// If a plugin fails to release its state for the message
    pub async fn remove_message(
        &self,
        destination: &Destination,
        id: MessageId,
    ) -> Result<bool, RedeliveryError> {
        let removed = self.take(destination, id).is_some();
        self.plugins().on_message_removed(destination, id).await?;
        Ok(removed)
    }

    /// Messages visible to consumers, in dispatch order.
    #[must_use]
    pub fn browse(&self, destination: &Destination) -> Vec<Message> {
        self.destinations
            .lock()
            .get(destination)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.state != EntryState::Held)
                    .map(|entry| entry.message.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of messages visible to consumers.
    #[must_use]
    pub fn depth(&self, destination: &Destination) -> usize {
        self.destinations.lock().get(destination).map_or(0, |entries| {
            entries
                .iter()
                .filter(|entry| entry.state != EntryState::Held)
                .count()
        })
    }

    /// Number of messages held on behalf of a plugin.
    #[must_use]
    pub fn held(&self, destination: &Destination) -> usize {
        self.destinations.lock().get(destination).map_or(0, |entries| {
            entries
                .iter()
                .filter(|entry| entry.state == EntryState::Held)
                .count()
        })
    }

    /// Insert a ready message unless one with the same id is already there.
    fn enqueue(&self, destination: &Destination, message: Message) -> bool {
        let inserted = {
            let mut destinations = self.destinations.lock();
            insert_once(destinations.entry(destination.clone()).or_default(), message)
        };

        if inserted {
            self.arrivals.notify_waiters();
        }
        inserted
    }

    fn take(&self, destination: &Destination, id: MessageId) -> Option<Message> {
        let mut destinations = self.destinations.lock();
        let entries = destinations.get_mut(destination)?;
        let position = entries.iter().position(|entry| entry.message.id == id)?;
        Some(entries.remove(position).message)
    }

    /// Hand the first ready message to `session`.
    pub(crate) fn claim(&self, destination: &Destination, session: SessionId) -> Option<Message> {
        let mut destinations = self.destinations.lock();
        let entry = destinations
            .get_mut(destination)?
            .iter_mut()
            .find(|entry| entry.state == EntryState::Ready)?;
        entry.state = EntryState::InFlight(session);
        Some(entry.message.clone())
    }

    /// The message if it is still in flight to `session`.
    pub(crate) fn in_flight(
        &self,
        destination: &Destination,
        id: MessageId,
        session: SessionId,
    ) -> Option<Message> {
        self.destinations
            .lock()
            .get(destination)?
            .iter()
            .find(|entry| {
                entry.message.id == id && entry.state == EntryState::InFlight(session)
            })
            .map(|entry| entry.message.clone())
    }

    /// Move an in-flight message to `state`, returning whether it was found.
    pub(crate) fn settle(
        &self,
        destination: &Destination,
        id: MessageId,
        session: SessionId,
        state: EntryState,
    ) -> bool {
        let settled = {
            let mut destinations = self.destinations.lock();
            destinations
                .get_mut(destination)
                .and_then(|entries| {
                    entries.iter_mut().find(|entry| {
                        entry.message.id == id && entry.state == EntryState::InFlight(session)
                    })
                })
                .map(|entry| {
                    if state == EntryState::Ready {
                        entry.message.redelivered = true;
                        entry.message.redelivery_count =
                            entry.message.redelivery_count.saturating_add(1);
                    }
                    entry.state = state;
                })
                .is_some()
        };

        if settled && state == EntryState::Ready {
            self.arrivals.notify_waiters();
        }
        settled
    }

    /// Remove a message that was in flight to `session`.
    pub(crate) fn consume(&self, destination: &Destination, id: MessageId, session: SessionId) {
        let mut destinations = self.destinations.lock();
        if let Some(entries) = destinations.get_mut(destination) {
            entries.retain(|entry| {
                !(entry.message.id == id && entry.state == EntryState::InFlight(session))
            });
        }
    }

    pub(crate) const fn arrivals(&self) -> &Notify {
        &self.arrivals
    }
}

fn insert_once(entries: &mut Vec<Entry>, message: Message) -> bool {
    if entries.iter().any(|entry| entry.message.id == message.id) {
        return false;
    }
    entries.push(Entry {
        message,
        state: EntryState::Ready,
    });
    true
}

#[async_trait]
impl DestinationDispatcher for Broker {
    async fn dispatch(
        &self,
        destination: &Destination,
        message: Message,
    ) -> Result<(), BrokerError> {
        self.check_available(destination)?;
        self.enqueue(destination, message);
        Ok(())
    }

    async fn remove_from_destination(
        &self,
        destination: &Destination,
        id: MessageId,
    ) -> Result<bool, BrokerError> {
        Ok(self.take(destination, id).is_some())
    }
}

#[async_trait]
impl UnitOfWork for Broker {
    async fn transfer(
        &self,
        from: &Destination,
        id: MessageId,
        to: &Destination,
        message: Message,
    ) -> Result<(), BrokerError> {
        self.check_available(to)?;

        {
            let mut destinations = self.destinations.lock();
            if let Some(entries) = destinations.get_mut(from) {
                entries.retain(|entry| entry.message.id != id);
            }
            insert_once(destinations.entry(to.clone()).or_default(), message);
        }

        self.arrivals.notify_waiters();
        Ok(())
    }
}
