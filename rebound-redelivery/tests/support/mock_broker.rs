//! In-memory stand-in for the hosting broker
//!
//! Implements both collaborator interfaces over a map of destination
//! contents, and can mark destinations unavailable to inject routing
//! failures.
#![allow(dead_code)] // Test utility module - not all methods used in every test

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rebound_common::{Destination, Message, MessageId};
use rebound_redelivery::{BrokerError, DestinationDispatcher, UnitOfWork};

#[derive(Debug, Default)]
pub struct MockBroker {
    destinations: Mutex<HashMap<Destination, Vec<Message>>>,
    unavailable: Mutex<HashSet<Destination>>,
    dispatches: AtomicUsize,
    transfers: AtomicUsize,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Place a message on a destination, as a producer would
    pub fn put(&self, destination: &Destination, message: Message) {
        self.destinations
            .lock()
            .entry(destination.clone())
            .or_default()
            .push(message);
    }

    pub fn messages(&self, destination: &Destination) -> Vec<Message> {
        self.destinations
            .lock()
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    pub fn depth(&self, destination: &Destination) -> usize {
        self.destinations
            .lock()
            .get(destination)
            .map_or(0, Vec::len)
    }

    /// Total number of messages across every destination
    pub fn total(&self) -> usize {
        self.destinations.lock().values().map(Vec::len).sum()
    }

    pub fn set_unavailable(&self, destination: &Destination, unavailable: bool) {
        let mut set = self.unavailable.lock();
        if unavailable {
            set.insert(destination.clone());
        } else {
            set.remove(destination);
        }
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.load(Ordering::SeqCst)
    }

    fn check_available(&self, destination: &Destination) -> Result<(), BrokerError> {
        if self.unavailable.lock().contains(destination) {
            return Err(BrokerError::DestinationUnavailable(destination.to_string()));
        }
        Ok(())
    }
}

fn insert_once(contents: &mut Vec<Message>, message: Message) {
    if !contents.iter().any(|existing| existing.id == message.id) {
        contents.push(message);
    }
}

#[async_trait]
impl DestinationDispatcher for MockBroker {
    async fn dispatch(
        &self,
        destination: &Destination,
        message: Message,
    ) -> Result<(), BrokerError> {
        self.check_available(destination)?;
        self.dispatches.fetch_add(1, Ordering::SeqCst);

        let mut destinations = self.destinations.lock();
        insert_once(destinations.entry(destination.clone()).or_default(), message);
        Ok(())
    }

    async fn remove_from_destination(
        &self,
        destination: &Destination,
        id: MessageId,
    ) -> Result<bool, BrokerError> {
        self.check_available(destination)?;

        let mut destinations = self.destinations.lock();
        let Some(contents) = destinations.get_mut(destination) else {
            return Ok(false);
        };
        let before = contents.len();
        contents.retain(|message| message.id != id);
        Ok(contents.len() != before)
    }
}

#[async_trait]
impl UnitOfWork for MockBroker {
    async fn transfer(
        &self,
        from: &Destination,
        id: MessageId,
        to: &Destination,
        message: Message,
    ) -> Result<(), BrokerError> {
        self.check_available(from)?;
        self.check_available(to)?;
        self.transfers.fetch_add(1, Ordering::SeqCst);

        let mut destinations = self.destinations.lock();
        if let Some(contents) = destinations.get_mut(from) {
            contents.retain(|existing| existing.id != id);
        }
        insert_once(destinations.entry(to.clone()).or_default(), message);
        Ok(())
    }
}
