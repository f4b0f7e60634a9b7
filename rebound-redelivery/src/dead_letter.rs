//! Dead-letter routing
//!
//! Computes where an exhausted message goes and moves it there in a single
//! unit of work.

use std::{fmt, sync::Arc};

use rebound_common::{Destination, Message, internal};
use serde::Deserialize;

use crate::{broker::UnitOfWork, error::RoutingError};

/// Property holding the destination a dead-lettered message came from.
pub const ORIGINAL_DESTINATION_PROPERTY: &str = "originalDestination";

/// Property holding why a message was dead-lettered.
pub const DEAD_LETTER_CAUSE_PROPERTY: &str = "deadLetterCause";

const fn default_use_queue_for_topic_messages() -> bool {
    true
}

fn default_shared_queue() -> String {
    "DLQ".to_string()
}

fn default_queue_prefix() -> String {
    "DLQ.Queue.".to_string()
}

fn default_topic_prefix() -> String {
    "DLQ.Topic.".to_string()
}

/// Where dead-lettered messages are sent.
///
/// ```ron
/// Shared(queue_name: "DLQ")
/// ```
///
/// ```ron
/// Individual(queue_prefix: "DLQ.Queue.", topic_prefix: "DLQ.Topic.")
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum DeadLetterStrategy {
    /// Every dead-lettered message goes to one well-known queue.
    Shared {
        #[serde(default = "default_shared_queue")]
        queue_name: String,
    },
    /// One dead-letter destination per original destination.
    Individual {
        #[serde(default = "default_queue_prefix")]
        queue_prefix: String,
        #[serde(default = "default_topic_prefix")]
        topic_prefix: String,
        /// Route topic messages to a queue rather than a topic.
        #[serde(default = "default_use_queue_for_topic_messages")]
        use_queue_for_topic_messages: bool,
    },
}

impl Default for DeadLetterStrategy {
    fn default() -> Self {
        Self::shared()
    }
}

impl DeadLetterStrategy {
    #[must_use]
    pub fn shared() -> Self {
        Self::Shared {
            queue_name: default_shared_queue(),
        }
    }

    #[must_use]
    pub fn individual() -> Self {
        Self::Individual {
            queue_prefix: default_queue_prefix(),
            topic_prefix: default_topic_prefix(),
            use_queue_for_topic_messages: default_use_queue_for_topic_messages(),
        }
    }

    /// The dead-letter destination for messages from `original`.
    #[must_use]
    pub fn destination_for(&self, original: &Destination) -> Destination {
        match self {
            Self::Shared { queue_name } => Destination::queue(queue_name.as_str()),
            Self::Individual {
                queue_prefix,
                topic_prefix,
                use_queue_for_topic_messages,
            } => {
                if original.is_queue() {
                    Destination::queue(format!("{queue_prefix}{}", original.name()))
                } else if *use_queue_for_topic_messages {
                    Destination::queue(format!("{topic_prefix}{}", original.name()))
                } else {
                    Destination::topic(format!("{topic_prefix}{}", original.name()))
                }
            }
        }
    }

    /// Whether `destination` is itself a dead-letter destination.
    #[must_use]
    pub fn is_dead_letter_destination(&self, destination: &Destination) -> bool {
        match self {
            Self::Shared { queue_name } => {
                destination.is_queue() && destination.name() == queue_name
            }
            Self::Individual {
                queue_prefix,
                topic_prefix,
                ..
            } => {
                destination.name().starts_with(queue_prefix.as_str())
                    || destination.name().starts_with(topic_prefix.as_str())
            }
        }
    }
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterCause {
    /// The redelivery budget ran out.
    MaximumRedeliveriesExceeded,
    /// No policy applied to the destination.
    NoPolicy,
}

impl DeadLetterCause {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MaximumRedeliveriesExceeded => "maximum redeliveries exceeded",
            Self::NoPolicy => "no redelivery policy",
        }
    }
}

impl fmt::Display for DeadLetterCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Performs terminal forwarding to a dead-letter destination.
#[derive(Clone)]
pub struct DeadLetterRouter {
    strategy: DeadLetterStrategy,
    unit_of_work: Arc<dyn UnitOfWork>,
}

impl fmt::Debug for DeadLetterRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterRouter")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl DeadLetterRouter {
    #[must_use]
    pub fn new(strategy: DeadLetterStrategy, unit_of_work: Arc<dyn UnitOfWork>) -> Self {
        Self {
            strategy,
            unit_of_work,
        }
    }

    #[must_use]
    pub const fn strategy(&self) -> &DeadLetterStrategy {
        &self.strategy
    }

    #[must_use]
    pub fn is_dead_letter_destination(&self, destination: &Destination) -> bool {
        self.strategy.is_dead_letter_destination(destination)
    }

    /// Move `message` from `original` to its dead-letter destination.
    ///
    /// The forwarded copy records where it came from and why. Retrying after
    /// a failure is safe: the unit of work never produces a second copy.
    ///
    /// # Errors
    /// [`RoutingError::Loop`] if `original` is already a dead-letter
    /// destination, [`RoutingError::Unavailable`] if the transfer failed.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self, message), fields(id = %message.id, from = %original))]
    pub async fn route(
        &self,
        message: &Message,
        original: &Destination,
        cause: &str,
    ) -> Result<Destination, RoutingError> {
        if self.is_dead_letter_destination(original) {
            return Err(RoutingError::Loop(original.to_string()));
        }

        let target = self.strategy.destination_for(original);

        let mut forwarded = message.clone();
        forwarded.set_property(ORIGINAL_DESTINATION_PROPERTY, original.to_string());
        forwarded.set_property(DEAD_LETTER_CAUSE_PROPERTY, cause);

        self.unit_of_work
            .transfer(original, message.id, &target, forwarded)
            .await
            .map_err(|source| RoutingError::Unavailable {
                destination: target.to_string(),
                source,
            })?;

        internal!(
            level = INFO,
            "Dead-lettered {} from {original} to {target}: {cause}",
            message.id
        );

        Ok(target)
    }
}
