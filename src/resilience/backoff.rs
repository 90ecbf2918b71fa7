//! Retry schedule for network association.

use std::time::Duration;

use rand::Rng;

use crate::config::schema::NetworkConfig;

/// How often and how far apart join attempts are made during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRetry {
    attempts: u32,
    base: Duration,
    cap: Duration,
}

impl JoinRetry {
    pub fn new(attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
            cap: cap.max(base),
        }
    }

    pub fn from_config(network: &NetworkConfig) -> Self {
        Self::new(
            network.join_attempts,
            Duration::from_millis(network.join_backoff_base_ms),
            Duration::from_millis(network.join_backoff_max_ms),
        )
    }

    /// Attempts before giving up; never zero.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait before the 0-based `attempt`.
    ///
    /// The first attempt goes out at once. After that the wait doubles from
    /// the base, gains up to a tenth of itself as jitter, and never exceeds the cap.
    pub fn delay_before<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        if attempt == 0 || self.base.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        let step = self.base.saturating_mul(factor).min(self.cap);
        let jitter_ms = (step.as_millis() / 10) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (step + jitter).min(self.cap)
    }

    /// Sleep out the wait before `attempt`.
    pub async fn pause(&self, attempt: u32) {
        let delay = self.delay_before(attempt, &mut rand::thread_rng());
        if !delay.is_zero() {
            tracing::trace!(attempt, delay_ms = delay.as_millis() as u64, "join backoff");
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for JoinRetry {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn retry(base_ms: u64, cap_ms: u64) -> JoinRetry {
        JoinRetry::new(5, Duration::from_millis(base_ms), Duration::from_millis(cap_ms))
    }

    #[test]
    fn first_attempt_goes_out_at_once() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(retry(100, 1000).delay_before(0, &mut rng), Duration::ZERO);
    }

    #[test]
    fn wait_doubles_and_never_passes_the_cap() {
        let policy = retry(100, 1000);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let d1 = policy.delay_before(1, &mut rng).as_millis();
            assert!((100..=110).contains(&d1), "{d1}");
            let d3 = policy.delay_before(3, &mut rng).as_millis();
            assert!((400..=440).contains(&d3), "{d3}");
            assert_eq!(policy.delay_before(12, &mut rng), Duration::from_millis(1000));
        }
    }

    #[test]
    fn schedule_follows_network_config() {
        let mut network = NetworkConfig::default();
        network.join_attempts = 0;
        network.join_backoff_base_ms = 0;
        let policy = JoinRetry::from_config(&network);
        assert_eq!(policy.attempts(), 1);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(policy.delay_before(4, &mut rng), Duration::ZERO);

        let defaults = JoinRetry::default();
        assert_eq!(defaults.attempts(), NetworkConfig::default().join_attempts);
    }
}
