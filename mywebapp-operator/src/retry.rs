use rand::Rng;
use std::time::Duration;

/// Exponential backoff for re-queued reconciles of one identity.
///
/// Retries are never abandoned, the delay is only capped at [`RetryPolicy::max_delay`].
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction (0.0 to 1.0) of the delay added or subtracted at random.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            jitter: jitter.clamp(0.0, 1.0),
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let jittered = if self.jitter > 0.0 {
            let range = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-range..=range)
        } else {
            capped
        };
        Duration::from_millis(jittered.clamp(0.0, self.max_delay.as_millis() as f64) as u64)
    }
}
