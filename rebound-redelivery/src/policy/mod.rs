//! Policy resolution
//!
//! Queues and topics resolve through independent [`RedeliveryPolicyMap`]s.

pub mod map;
pub mod pattern;
pub mod redelivery;

pub use map::{PolicyEntry, RedeliveryPolicyMap};
pub use pattern::{DestinationPattern, Segment, Specificity};
use rebound_common::{Destination, DestinationKind};
pub use redelivery::{RedeliveryPolicy, UNLIMITED_REDELIVERIES};

use crate::error::PolicyResolutionError;

/// Resolver for per-destination redelivery policies
#[derive(Debug, Clone, Default)]
pub struct PolicyResolver {
    queues: RedeliveryPolicyMap,
    topics: RedeliveryPolicyMap,
}

impl PolicyResolver {
    #[must_use]
    pub const fn new(queues: RedeliveryPolicyMap, topics: RedeliveryPolicyMap) -> Self {
        Self { queues, topics }
    }

    #[must_use]
    pub const fn map_for(&self, kind: DestinationKind) -> &RedeliveryPolicyMap {
        match kind {
            DestinationKind::Queue => &self.queues,
            DestinationKind::Topic => &self.topics,
        }
    }

    /// Resolve the policy for one attempt.
    ///
    /// # Errors
    /// If neither a pattern nor the default entry of the relevant map applies
    pub fn resolve(
        &self,
        destination: &Destination,
    ) -> Result<RedeliveryPolicy, PolicyResolutionError> {
        self.map_for(destination.kind())
            .resolve(destination.name())
            .cloned()
            .map_err(|_| PolicyResolutionError {
                destination: destination.to_string(),
            })
    }
}
