//! Fault injection for exercising resurrection.
//!
//! After every successful claim the node asks its [`FaultPolicy`] whether
//! the new instance should die, and after how long. The default policy
//! never kills anything.

use std::time::Duration;

use rand::Rng;

use crate::instance::Instance;

/// Decides which freshly claimed instances are scheduled to stop.
pub trait FaultPolicy: Send + Sync {
    /// Return a delay to stop `instance` after, or `None` to keep it.
    fn doom(&self, instance: &Instance) -> Option<Duration>;
}

/// Never schedules a death.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverFail;

impl FaultPolicy for NeverFail {
    fn doom(&self, _instance: &Instance) -> Option<Duration> {
        None
    }
}

/// Kills a random fraction of instances after a random delay.
#[derive(Debug, Clone)]
pub struct RandomFailure {
    /// Chance in `[0, 1]` that a claimed instance is doomed.
    pub probability: f64,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RandomFailure {
    fn default() -> Self {
        Self {
            probability: 0.25,
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl FaultPolicy for RandomFailure {
    fn doom(&self, _instance: &Instance) -> Option<Duration> {
        let mut rng = rand::thread_rng();
        if !rng.gen_bool(self.probability.clamp(0.0, 1.0)) {
            return None;
        }
        if self.max_delay <= self.min_delay {
            return Some(self.min_delay);
        }
        Some(rng.gen_range(self.min_delay..self.max_delay))
    }
}
