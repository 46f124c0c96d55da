//! Exponential backoff for task retries and storage reconnects.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            jitter: 0.1,
        }
    }

    /// Symmetric jitter as a fraction of the delay, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial.as_millis() as f64 * self.factor.powi(exponent);
        let clamped = base.min(self.max.as_millis() as f64);

        let delay = if self.jitter > 0.0 {
            let range = clamped * self.jitter;
            (clamped + rand::random::<f64>() * range * 2.0 - range).max(0.0)
        } else {
            clamped
        };
        Duration::from_millis(delay as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300), 2.0)
    }
}
