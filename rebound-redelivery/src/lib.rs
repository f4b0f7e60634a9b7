//! Broker-side redelivery and dead-letter handling
//!
//! This crate provides:
//! - Per-destination redelivery policies with wildcard resolution
//! - Per-message redelivery counting
//! - A durable, tick-driven scheduler for delayed re-injection
//! - Dead-letter routing with shared or per-destination strategies
//! - The broker plugin tying them together

pub mod broker;
mod config;
pub mod counter;
pub mod dead_letter;
mod error;
pub mod plugin;
pub mod policy;
pub mod scheduler;

// Re-export collaborator interfaces
pub use broker::{DestinationDispatcher, UnitOfWork};
pub use config::RedeliveryConfig;
pub use counter::{DeliveryCounterStore, DeliveryPhase, DeliveryState};
pub use dead_letter::{DeadLetterCause, DeadLetterRouter, DeadLetterStrategy};
// Re-export error types
pub use error::{
    BrokerError, PatternError, PolicyResolutionError, RedeliveryError, RoutingError,
    SchedulingError,
};
pub use plugin::{
    BrokerPlugin, NackCause, NackOutcome, PluginChain, RedeliveryPlugin,
    redelivery::REDELIVERY_DELAY_PROPERTY,
};
pub use policy::{DestinationPattern, PolicyResolver, RedeliveryPolicy, RedeliveryPolicyMap};
pub use scheduler::{JobHandler, RedeliveryScheduler, SchedulerConfig, TickReport};
