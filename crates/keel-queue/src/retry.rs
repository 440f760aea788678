use std::time::Duration;

use rand::Rng;

/// Exponential backoff for failed tasks: `base * multiplier^(attempts-1)`,
/// capped, with a jitter band applied last so consecutive delays stay
/// monotone before jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub multiplier: f64,
    /// Jitter band as a fraction of the delay (0.2 = ±20%).
    pub jitter_ratio: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_ratio: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic delay for the given attempt count (1-indexed), before
    /// jitter.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exponent as i32);
        Duration::from_secs_f64(raw.min(self.cap.as_secs_f64()))
    }

    /// [`delay`](Self::delay) with the jitter band applied.
    pub fn jittered(&self, attempts: u32) -> Duration {
        let delay = self.delay(attempts);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng()
            .gen_range(1.0 - self.jitter_ratio..=1.0 + self.jitter_ratio);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}
