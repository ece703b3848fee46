//! Delivery pacing for the continuous worker.
//!
//! After every processed job, whatever its outcome, the worker waits a uniformly random interval
//! in `[min, max]` so that deliveries from one process never arrive at the provider in bursts.
use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacer {
    min: Duration,
    max: Duration,
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(10))
    }
}

impl Pacer {
    /// The bounds are swapped if given in the wrong order.
    pub const fn new(min: Duration, max: Duration) -> Self {
        if min.as_nanos() > max.as_nanos() {
            Self { min: max, max: min }
        } else {
            Self { min, max }
        }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn next_delay(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}
