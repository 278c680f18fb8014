use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectPolicy;

/// Exponential reconnect delay with symmetric jitter.
///
/// The un-jittered delay doubles from `base` up to `max` and returns to
/// `base` after a successful connection.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let base = Duration::from_millis(policy.base_ms.max(1));
        let max = Duration::from_millis(policy.max_ms).max(base);
        Self {
            base,
            max,
            current: base,
            jitter: policy.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the next attempt, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);
        self.jittered(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor)
    }
}
