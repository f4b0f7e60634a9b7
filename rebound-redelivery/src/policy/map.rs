use serde::Deserialize;

use super::{
    pattern::{DestinationPattern, PatternTrie},
    redelivery::RedeliveryPolicy,
};
use crate::error::{PatternError, PolicyResolutionError};

/// One `pattern -> policy` registration, as written in configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyEntry {
    pub destination: String,
    #[serde(default)]
    pub policy: RedeliveryPolicy,
}

#[derive(Debug, Deserialize)]
struct PolicyMapConfig {
    #[serde(default)]
    entries: Vec<PolicyEntry>,
    #[serde(default)]
    default_entry: Option<RedeliveryPolicy>,
}

/// Ordered `pattern -> policy` registrations with an optional fallback.
///
/// ```ron
/// (
///     entries: [
///         (destination: "Orders.>", policy: (maximum_redeliveries: 2)),
///     ],
///     default_entry: Some((redelivery_delay_ms: 5000)),
/// )
/// ```
///
/// The default map (as used when configuration omits it) has no entries and
/// the default policy as its fallback.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "PolicyMapConfig")]
pub struct RedeliveryPolicyMap {
    entries: Vec<(DestinationPattern, RedeliveryPolicy)>,
    default_entry: Option<RedeliveryPolicy>,
    trie: PatternTrie,
}

impl Default for RedeliveryPolicyMap {
    fn default() -> Self {
        Self::empty().with_default_entry(RedeliveryPolicy::default())
    }
}

impl TryFrom<PolicyMapConfig> for RedeliveryPolicyMap {
    type Error = PatternError;

    fn try_from(config: PolicyMapConfig) -> Result<Self, Self::Error> {
        let mut map = Self::empty();
        map.default_entry = config.default_entry;

        for entry in config.entries {
            map.insert(&entry.destination, entry.policy)?;
        }

        Ok(map)
    }
}

impl RedeliveryPolicyMap {
    /// A map with no entries and no fallback; every lookup fails.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            default_entry: None,
            trie: PatternTrie::default(),
        }
    }

    /// # Errors
    /// If `pattern` is not a valid destination pattern
    pub fn with_entry(
        mut self,
        pattern: &str,
        policy: RedeliveryPolicy,
    ) -> Result<Self, PatternError> {
        self.insert(pattern, policy)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_default_entry(mut self, policy: RedeliveryPolicy) -> Self {
        self.default_entry = Some(policy);
        self
    }

    /// Register a policy; earlier registrations win ties.
    ///
    /// # Errors
    /// If `pattern` is not a valid destination pattern
    pub fn insert(&mut self, pattern: &str, policy: RedeliveryPolicy) -> Result<(), PatternError> {
        let pattern = DestinationPattern::parse(pattern)?;
        self.trie.insert(&pattern, self.entries.len());
        self.entries.push((pattern, policy));
        Ok(())
    }

    pub fn set_default_entry(&mut self, policy: Option<RedeliveryPolicy>) {
        self.default_entry = policy;
    }

    #[must_use]
    pub const fn default_entry(&self) -> Option<&RedeliveryPolicy> {
        self.default_entry.as_ref()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&DestinationPattern, &RedeliveryPolicy)> {
        self.entries.iter().map(|(pattern, policy)| (pattern, policy))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The policy for `name`: the most specific matching entry, else the
    /// default entry.
    ///
    /// # Errors
    /// If nothing matches and there is no default entry
    pub fn resolve(&self, name: &str) -> Result<&RedeliveryPolicy, PolicyResolutionError> {
        self.trie
            .candidates(name)
            .into_iter()
            .max_by(|&a, &b| {
                self.entries[a]
                    .0
                    .specificity()
                    .cmp(&self.entries[b].0.specificity())
                    .then(b.cmp(&a))
            })
            .map(|index| &self.entries[index].1)
            .or(self.default_entry.as_ref())
            .ok_or_else(|| PolicyResolutionError {
                destination: name.to_string(),
            })
    }
}
