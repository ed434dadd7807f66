//! Hesitation curve for the claim protocol.
//!
//! Before volunteering for a slot a node waits `base × count^exponent`,
//! where `count` is how many instances of the same app it already runs.
//! Busy nodes therefore back off a little longer, which spreads a burst of
//! identical start requests across the fleet. The curve is a tuning knob;
//! correctness comes from the store's create-if-absent.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hesitation {
    pub base: Duration,
    /// Must be `>= 0` to keep the delay non-decreasing in `count`.
    pub exponent: f64,
}

impl Default for Hesitation {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(10),
            exponent: 0.2,
        }
    }
}

impl Hesitation {
    /// Upper bound on any single delay.
    pub const MAX_DELAY: Duration = Duration::from_secs(60);

    /// Never wait.
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            exponent: 0.0,
        }
    }

    pub fn delay_for(&self, count: usize) -> Duration {
        if count == 0 || self.base.is_zero() {
            return Duration::ZERO;
        }
        let factor = (count as f64).powf(self.exponent.max(0.0));
        Duration::try_from_secs_f64(self.base.as_secs_f64() * factor)
            .map_or(Self::MAX_DELAY, |delay| delay.min(Self::MAX_DELAY))
    }
}
