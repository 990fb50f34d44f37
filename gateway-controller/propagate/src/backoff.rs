use rand::Rng;
use std::time::Duration;

/// Bounds how a worker retries an event the transport rejected transiently.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,

    /// Total publish attempts per event, including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            max_attempts: 8,
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts.max(1)
    }

    /// The un-jittered delay after the given (1-based) failed attempt, capped at `max`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }

    /// Scales the base delay by a random factor in `[0.5, 1.5)` so that workers retrying the
    /// same unreachable proxy spread out.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let secs = self.base_delay(attempt).as_secs_f64() * jitter;
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }
}
