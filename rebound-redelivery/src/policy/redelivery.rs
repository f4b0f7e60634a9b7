//! Redelivery policy for negatively acknowledged messages.
//!
//! A policy decides two things for a given attempt: whether the message still
//! has redelivery budget left, and how long it stays invisible before being
//! re-injected.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// `maximum_redeliveries` value meaning "never dead-letter".
pub const UNLIMITED_REDELIVERIES: i32 = -1;

/// Redelivery behaviour for one destination (or pattern of destinations).
///
/// All delays are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedeliveryPolicy {
    /// Delay before the first redelivery.
    ///
    /// Default: 1000 ms
    #[serde(default = "defaults::initial_redelivery_delay_ms")]
    pub initial_redelivery_delay_ms: u64,

    /// Delay before every later redelivery.
    ///
    /// Default: 1000 ms
    #[serde(default = "defaults::redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,

    /// Redeliveries allowed before the message is dead-lettered.
    ///
    /// `-1` means unlimited. Default: 6
    #[serde(default = "defaults::maximum_redeliveries")]
    pub maximum_redeliveries: i32,

    /// Scale `redelivery_delay_ms` by `back_off_multiplier^(count - 1)`.
    ///
    /// Default: `false`
    #[serde(default)]
    pub use_exponential_back_off: bool,

    /// Default: 5.0
    #[serde(default = "defaults::back_off_multiplier")]
    pub back_off_multiplier: f64,

    /// Upper bound on any computed delay.
    ///
    /// Default: none
    #[serde(default)]
    pub maximum_redelivery_delay_ms: Option<u64>,

    /// Randomise each delay within ±factor, so messages rolled back together
    /// do not come back together.
    ///
    /// Default: 0.0 (off)
    #[serde(default)]
    pub collision_avoidance_factor: f64,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            initial_redelivery_delay_ms: defaults::initial_redelivery_delay_ms(),
            redelivery_delay_ms: defaults::redelivery_delay_ms(),
            maximum_redeliveries: defaults::maximum_redeliveries(),
            use_exponential_back_off: false,
            back_off_multiplier: defaults::back_off_multiplier(),
            maximum_redelivery_delay_ms: None,
            collision_avoidance_factor: 0.0,
        }
    }
}

impl RedeliveryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy that dead-letters on the first negative acknowledgment.
    #[must_use]
    pub fn no_redelivery() -> Self {
        Self {
            maximum_redeliveries: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.maximum_redeliveries == UNLIMITED_REDELIVERIES
    }

    /// Whether a message whose count has just become `redelivery_count` may
    /// be redelivered again.
    #[must_use]
    pub fn allows(&self, redelivery_count: u32) -> bool {
        if self.is_unlimited() {
            return true;
        }

        u32::try_from(self.maximum_redeliveries)
            .is_ok_and(|maximum| redelivery_count <= maximum)
    }

    /// The delay for the `redelivery_count`-th redelivery (1-indexed).
    #[must_use]
    pub fn delay_for(&self, redelivery_count: u32) -> u64 {
        let base = if redelivery_count <= 1 {
            self.initial_redelivery_delay_ms
        } else if self.use_exponential_back_off && self.back_off_multiplier > 1.0 {
            let exponent = i32::try_from(redelivery_count - 1).unwrap_or(i32::MAX);
            scale(self.redelivery_delay_ms, self.back_off_multiplier.powi(exponent))
        } else {
            self.redelivery_delay_ms
        };

        let capped = self
            .maximum_redelivery_delay_ms
            .map_or(base, |maximum| base.min(maximum));

        self.avoid_collision(capped)
    }

    fn avoid_collision(&self, delay: u64) -> u64 {
        let factor = self.collision_avoidance_factor.clamp(0.0, 1.0);
        if factor <= 0.0 || delay == 0 {
            return delay;
        }

        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-factor..=factor);
        scale(delay, 1.0 + jitter)
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn scale(delay: u64, by: f64) -> u64 {
    let scaled = (delay as f64) * by;
    if scaled >= u64::MAX as f64 {
        u64::MAX
    } else {
        scaled.max(0.0) as u64
    }
}

mod defaults {
    pub const fn initial_redelivery_delay_ms() -> u64 {
        1000
    }

    pub const fn redelivery_delay_ms() -> u64 {
        1000
    }

    pub const fn maximum_redeliveries() -> i32 {
        6
    }

    pub const fn back_off_multiplier() -> f64 {
        5.0
    }
}
