use rand::Rng;
use std::time::Duration;

/// Exponential reconnect delay: base, doubling, capped, with symmetric jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Delay before the next attempt without jitter
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        let factor = 2_u32.saturating_pow(self.attempt);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Jittered delay for the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay();
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter == 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64(1.0 + spread)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubling_is_capped() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 0.0);
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let mut backoff = Backoff::new(Duration::from_millis(1000), Duration::from_secs(60), 0.2);
        for _ in 0..50 {
            backoff.reset();
            let d = backoff.next_delay();
            assert!(d >= Duration::from_millis(799) && d <= Duration::from_millis(1201), "{d:?}");
        }
    }

    #[test]
    fn test_huge_attempt_count_does_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);
        for _ in 0..200 {
            backoff.next_delay();
        }
        assert_eq!(backoff.current_delay(), Duration::from_secs(60));
    }
}
