//! Interfaces the hosting broker provides to the redelivery subsystem

use async_trait::async_trait;
use rebound_common::{Destination, Message, MessageId};

use crate::error::BrokerError;

/// Destination registry / dispatcher.
#[async_trait]
pub trait DestinationDispatcher: Send + Sync {
    /// Make `message` available to consumers of `destination`.
    ///
    /// Must be idempotent on message identity: dispatching a message that is
    /// already present does not create a second copy.
    async fn dispatch(&self, destination: &Destination, message: Message)
    -> Result<(), BrokerError>;

    /// Take a message out of normal dispatch, returning whether it was present.
    async fn remove_from_destination(
        &self,
        destination: &Destination,
        id: MessageId,
    ) -> Result<bool, BrokerError>;
}

/// Transactional unit of work.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Atomically remove `id` from `from` (if present) and deliver `message`
    /// to `to`.
    ///
    /// Repeating a transfer that already happened must not create a second
    /// copy at `to`.
    async fn transfer(
        &self,
        from: &Destination,
        id: MessageId,
        to: &Destination,
        message: Message,
    ) -> Result<(), BrokerError>;
}
