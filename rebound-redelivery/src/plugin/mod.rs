//! Broker interception points
//!
//! The broker offers each delivery lifecycle event to an ordered chain of
//! plugins. The first plugin to report [`NackOutcome::Handled`] for a
//! negative acknowledgment owns the message from then on; if none does, the
//! broker falls back to its own immediate redelivery.

pub mod redelivery;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use rebound_common::{Destination, Message, MessageId, internal};
pub use redelivery::RedeliveryPlugin;

use crate::error::RedeliveryError;

/// Why a consumer gave a message back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackCause {
    /// The consumer's transaction rolled back.
    Rollback,
    /// The consumer's session was recovered.
    Recover,
    /// The message's delivery lease lapsed.
    Expired,
}

impl fmt::Display for NackCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rollback => "rollback",
            Self::Recover => "recover",
            Self::Expired => "expired",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The plugin took over the message; the broker must not redeliver it.
    Handled,
    /// Fall through to the next plugin, or the broker's default.
    NotHandled,
}

impl NackOutcome {
    #[must_use]
    pub const fn is_handled(self) -> bool {
        matches!(self, Self::Handled)
    }
}

/// A participant in the broker's delivery path.
///
/// Every hook has a pass-through default.
#[async_trait]
pub trait BrokerPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// A message is about to be dispatched to `destination`.
    async fn on_send(
        &self,
        _destination: &Destination,
        message: Message,
    ) -> Result<Message, RedeliveryError> {
        Ok(message)
    }

    /// A consumer acknowledged a message.
    async fn on_acknowledge(
        &self,
        _destination: &Destination,
        _id: MessageId,
    ) -> Result<(), RedeliveryError> {
        Ok(())
    }

    /// A consumer negatively acknowledged a message.
    ///
    /// # Errors
    /// An error means the message stays where it was and the broker retries
    /// the hook later.
    async fn on_negative_ack(
        &self,
        _destination: &Destination,
        _message: &Message,
        _cause: NackCause,
    ) -> Result<NackOutcome, RedeliveryError> {
        Ok(NackOutcome::NotHandled)
    }

    /// A message was removed administratively (purge, expiry, delete).
    async fn on_message_removed(
        &self,
        _destination: &Destination,
        _id: MessageId,
    ) -> Result<(), RedeliveryError> {
        Ok(())
    }
}

/// Ordered set of installed plugins.
#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn BrokerPlugin>>,
}

impl fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|plugin| plugin.name()))
            .finish()
    }
}

impl PluginChain {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, plugin: Arc<dyn BrokerPlugin>) -> Self {
        self.push(plugin);
        self
    }

    pub fn push(&mut self, plugin: Arc<dyn BrokerPlugin>) {
        internal!(level = INFO, "Installing broker plugin {}", plugin.name());
        self.plugins.push(plugin);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// # Errors
    /// The first plugin error, after which later plugins are not consulted
    pub async fn on_send(
        &self,
        destination: &Destination,
        mut message: Message,
    ) -> Result<Message, RedeliveryError> {
        for plugin in &self.plugins {
            message = plugin.on_send(destination, message).await?;
        }
        Ok(message)
    }

    /// # Errors
    /// The first plugin error, after which later plugins are not consulted
    pub async fn on_acknowledge(
        &self,
        destination: &Destination,
        id: MessageId,
    ) -> Result<(), RedeliveryError> {
        for plugin in &self.plugins {
            plugin.on_acknowledge(destination, id).await?;
        }
        Ok(())
    }

    /// Offer a negative acknowledgment to each plugin until one handles it.
    ///
    /// # Errors
    /// The first plugin error, after which later plugins are not consulted
    pub async fn on_negative_ack(
        &self,
        destination: &Destination,
        message: &Message,
        cause: NackCause,
    ) -> Result<NackOutcome, RedeliveryError> {
        internal!("Dispatching negative ack for {} ({cause})", message.id);

        for plugin in &self.plugins {
            if plugin
                .on_negative_ack(destination, message, cause)
                .await?
                .is_handled()
            {
                internal!(level = DEBUG, "{} handled {}", plugin.name(), message.id);
                return Ok(NackOutcome::Handled);
            }
        }

        Ok(NackOutcome::NotHandled)
    }

    /// # Errors
    /// The first plugin error, after which later plugins are not consulted
    pub async fn on_message_removed(
        &self,
        destination: &Destination,
        id: MessageId,
    ) -> Result<(), RedeliveryError> {
        for plugin in &self.plugins {
            plugin.on_message_removed(destination, id).await?;
        }
        Ok(())
    }
}
