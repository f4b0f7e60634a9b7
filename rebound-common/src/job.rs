use serde::{Deserialize, Serialize};

use crate::{Destination, Message, MessageId};

/// File extension used for persisted jobs.
pub const JOB_EXTENSION: &str = "job";

/// Identifier of a scheduled job
///
/// Derived from the identity of the message it carries, so that scheduling
/// the same message twice always collides on the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId {
    message: MessageId,
}

impl JobId {
    #[must_use]
    pub const fn for_message(message: MessageId) -> Self {
        Self { message }
    }

    #[must_use]
    pub const fn message_id(&self) -> MessageId {
        self.message
    }

    /// Parse a job id from a filename like `01ARZ3NDEKTSV4RRFFQ69G5FAV.job`
    ///
    /// Anything containing a path separator, a traversal pattern, the wrong
    /// extension or a malformed ULID is rejected.
    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }

        let stem = filename
            .strip_suffix(JOB_EXTENSION)
            .and_then(|stem| stem.strip_suffix('.'))?;

        let id = ulid::Ulid::from_string(stem).ok()?;

        Some(Self::for_message(MessageId::new(id)))
    }

    #[must_use]
    pub fn filename(&self) -> String {
        format!("{}.{JOB_EXTENSION}", self.message)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.message)
    }
}

/// What firing a job does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Re-inject the payload into its original destination.
    Redelivery,
    /// Retry a dead-letter transfer that previously failed.
    DeadLetter { cause: String },
}

/// A durable, time-triggered job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub kind: JobKind,
    /// The destination the payload belongs to (and is re-injected into).
    pub target: Destination,
    pub payload: Message,
    /// Absolute fire time, milliseconds since the Unix epoch.
    pub fire_at_ms: u64,
    pub delay_ms: u64,
    /// The message's redelivery count when this job was scheduled.
    pub attempt: u32,
    /// Insertion order; assigned by the scheduler, breaks ties between equal fire times.
    pub sequence: u64,
}

impl ScheduledJob {
    #[must_use]
    pub fn redelivery(target: Destination, payload: Message, now_ms: u64, delay_ms: u64) -> Self {
        Self {
            id: JobId::for_message(payload.id),
            kind: JobKind::Redelivery,
            target,
            attempt: payload.redelivery_count,
            payload,
            fire_at_ms: now_ms.saturating_add(delay_ms),
            delay_ms,
            sequence: 0,
        }
    }

    #[must_use]
    pub fn dead_letter(
        target: Destination,
        payload: Message,
        cause: impl Into<String>,
        fire_at_ms: u64,
    ) -> Self {
        Self {
            id: JobId::for_message(payload.id),
            kind: JobKind::DeadLetter {
                cause: cause.into(),
            },
            target,
            attempt: payload.redelivery_count,
            payload,
            fire_at_ms,
            delay_ms: 0,
            sequence: 0,
        }
    }

    #[must_use]
    pub const fn is_due(&self, now_ms: u64) -> bool {
        self.fire_at_ms <= now_ms
    }
}
