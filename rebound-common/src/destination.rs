use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a destination is point-to-point or publish-subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DestinationKind {
    Queue,
    Topic,
}

impl DestinationKind {
    const fn scheme(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Topic => "topic",
        }
    }
}

/// A named queue or topic on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination {
    kind: DestinationKind,
    name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DestinationParseError {
    #[error("Destination is missing a scheme: {0}")]
    MissingScheme(String),

    #[error("Unknown destination scheme '{0}'")]
    UnknownScheme(String),

    #[error("Destination name is empty")]
    EmptyName,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Queue,
            name: name.into(),
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Topic,
            name: name.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> DestinationKind {
        self.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_queue(&self) -> bool {
        matches!(self.kind, DestinationKind::Queue)
    }

    #[must_use]
    pub const fn is_topic(&self) -> bool {
        matches!(self.kind, DestinationKind::Topic)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind.scheme(), self.name)
    }
}

impl FromStr for Destination {
    type Err = DestinationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, name) = s
            .split_once("://")
            .ok_or_else(|| DestinationParseError::MissingScheme(s.to_string()))?;

        if name.is_empty() {
            return Err(DestinationParseError::EmptyName);
        }

        match scheme {
            "queue" => Ok(Self::queue(name)),
            "topic" => Ok(Self::topic(name)),
            other => Err(DestinationParseError::UnknownScheme(other.to_string())),
        }
    }
}
