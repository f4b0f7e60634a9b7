//! Typed error handling for redelivery operations.
//!
//! Failures fall into a few groups that callers treat differently:
//! - Policy resolution failures degrade to an immediate dead-letter
//! - Scheduling failures leave the message where it was so the caller can retry
//! - Routing failures hold the message and retry on a later tick

use rebound_common::{JobId, MessageId};
use rebound_store::StoreError;
use thiserror::Error;

/// Top-level redelivery error type.
#[derive(Debug, Error)]
pub enum RedeliveryError {
    #[error("Policy resolution failed: {0}")]
    PolicyResolution(#[from] PolicyResolutionError),

    #[error("Scheduling failed: {0}")]
    Scheduling(#[from] SchedulingError),

    /// A job with this id is already pending; the existing job was kept.
    #[error("Duplicate job: {0}")]
    DuplicateJob(JobId),

    #[error("Dead-letter routing failed: {0}")]
    Routing(#[from] RoutingError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The message is mid-decision and cannot be re-injected yet.
    #[error("Message {0} is not ready to be re-injected")]
    NotReady(MessageId),
}

/// No pattern and no default entry matched a destination.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("No redelivery policy matches {destination}")]
pub struct PolicyResolutionError {
    pub destination: String,
}

/// Invalid destination pattern.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("Destination pattern is empty")]
    Empty,

    #[error("Destination pattern '{0}' contains an empty segment")]
    EmptySegment(String),

    #[error("'>' may only appear as the last segment of '{0}'")]
    RestNotLast(String),
}

/// The scheduler could not accept or recover a job.
#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("Scheduler has not been initialised")]
    NotInitialized,

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Failed to persist {id} after {attempts} attempts: {source}")]
    Persist {
        id: JobId,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Failed to recover persisted jobs: {0}")]
    Recovery(#[source] StoreError),

    #[error("Failed to flush pending jobs: {0}")]
    Flush(#[source] StoreError),

    #[error("Failed to persist {failed} of {total} pending jobs on shutdown: {source}")]
    Unpersisted {
        failed: usize,
        total: usize,
        #[source]
        source: StoreError,
    },
}

/// A dead-letter transfer failed.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Dead-letter destination {destination} is unavailable: {source}")]
    Unavailable {
        destination: String,
        #[source]
        source: BrokerError,
    },

    #[error("Refusing to dead-letter a message from dead-letter destination {0}")]
    Loop(String),
}

/// Errors reported by the hosting broker's collaborator interfaces.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Destination {0} is unavailable")]
    DestinationUnavailable(String),

    #[error("Message {0} not found")]
    MessageNotFound(MessageId),

    #[error("Internal broker error: {0}")]
    Internal(String),
}

impl RedeliveryError {
    /// Returns `true` if trying the same operation again later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Scheduling(
                SchedulingError::Persist { .. }
                | SchedulingError::Flush(_)
                | SchedulingError::Unpersisted { .. },
            )
            | Self::Routing(RoutingError::Unavailable { .. })
            | Self::Broker(BrokerError::DestinationUnavailable(_))
            | Self::NotReady(_) => true,
            Self::PolicyResolution(_)
            | Self::Scheduling(_)
            | Self::DuplicateJob(_)
            | Self::Routing(_)
            | Self::Broker(_) => false,
        }
    }

    /// Returns `true` if the subsystem is misconfigured or stopped and no
    /// retry will help.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Scheduling(SchedulingError::NotInitialized | SchedulingError::ShuttingDown)
                | Self::Routing(RoutingError::Loop(_))
        )
    }

    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateJob(_))
    }

    #[must_use]
    pub const fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady(_))
    }
}

impl RoutingError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
