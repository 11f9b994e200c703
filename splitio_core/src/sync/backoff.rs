//! Capped exponential backoff with jitter, shared by reconnect and retry
//! loops.
use std::time::Duration;

use rand::Rng;

pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Backoff {
        Backoff {
            base,
            max,
            attempt: 0,
        }
    }

    /// Next wait: `base * 2^attempt`, capped at `max`, with +/-50% jitter so
    /// a fleet of clients doesn't reconnect in lockstep.
    pub fn next(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        jitter(exp)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Apply +/-50% randomized jitter to an interval.
pub fn jitter(interval: Duration) -> Duration {
    if interval.is_zero() {
        return interval;
    }
    let factor = rand::thread_rng().gen_range(0.5..=1.5);
    interval.mul_f64(factor)
}

/// Randomize a poll interval within [0.5x, 2x], used when interval
/// randomization is enabled.
pub fn randomize_interval(interval: Duration) -> Duration {
    if interval.is_zero() {
        return interval;
    }
    let factor = rand::thread_rng().gen_range(0.5..=2.0);
    interval.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_exponentially_up_to_the_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        // With +/-50% jitter, wait N lies within [0.5, 1.5] * min(2^N, 60).
        let first = backoff.next();
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1500));
        let second = backoff.next();
        assert!(second >= Duration::from_secs(1) && second <= Duration::from_secs(3));

        for _ in 0..10 {
            backoff.next();
        }
        let capped = backoff.next();
        assert!(capped <= Duration::from_secs(90));
        assert!(capped >= Duration::from_secs(30));
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let wait = backoff.next();
        assert!(wait <= Duration::from_millis(1500));
    }

    #[test]
    fn randomized_intervals_stay_in_band() {
        let interval = Duration::from_secs(30);
        for _ in 0..100 {
            let randomized = randomize_interval(interval);
            assert!(randomized >= Duration::from_secs(15));
            assert!(randomized <= Duration::from_secs(60));
        }
    }
}
