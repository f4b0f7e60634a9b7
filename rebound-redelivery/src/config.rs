use serde::Deserialize;

use crate::{
    dead_letter::DeadLetterStrategy,
    policy::{PolicyResolver, RedeliveryPolicyMap},
    scheduler::SchedulerConfig,
};

/// Redelivery subsystem configuration
///
/// ```ron
/// (
///     queue_policies: (
///         entries: [(destination: "Orders.>", policy: (maximum_redeliveries: 2))],
///         default_entry: Some(()),
///     ),
///     dead_letter: Individual(use_queue_for_topic_messages: true),
///     scheduler: (tick_interval_ms: 250),
/// )
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedeliveryConfig {
    /// Policies for point-to-point destinations
    #[serde(default)]
    pub queue_policies: RedeliveryPolicyMap,

    /// Policies for publish-subscribe destinations
    #[serde(default)]
    pub topic_policies: RedeliveryPolicyMap,

    #[serde(default)]
    pub dead_letter: DeadLetterStrategy,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl RedeliveryConfig {
    #[must_use]
    pub fn resolver(&self) -> PolicyResolver {
        PolicyResolver::new(self.queue_policies.clone(), self.topic_policies.clone())
    }
}
