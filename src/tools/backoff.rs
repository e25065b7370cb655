//! Hand-rolled exponential backoff with optional jitter, used by the
//! sender's retry wrapper rather than pulling in a dedicated backoff crate.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(1u64 << exp);
        let mut delay = Duration::from_millis(millis).min(self.max_delay);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.9..=1.1);
            delay = Duration::from_secs_f64(delay.as_secs_f64() * factor);
        }
        delay
    }
}
