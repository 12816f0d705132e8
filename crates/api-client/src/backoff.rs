use app_config::BackoffSettings;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with upward jitter for reconnection attempts.
///
/// `delay = min(base * 2^attempt, cap) * (1 + j)` with `j` drawn from
/// `[0, jitter]`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    max_attempts: u32,
    attempt: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_settings(&BackoffSettings::default())
    }
}

impl ExponentialBackoff {
    /// Jitter is clamped to `[0, BackoffSettings::MAX_JITTER]`.
    pub fn new(base: Duration, cap: Duration, jitter: f64, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            jitter: if jitter.is_finite() { jitter.clamp(0.0, BackoffSettings::MAX_JITTER) } else { 0.0 },
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &BackoffSettings) -> Self {
        Self::new(settings.base(), settings.cap(), settings.jitter, settings.max_attempts)
    }

    /// The delay for `attempt` given a jitter sample in `[0, 1]`. Pure, so
    /// the schedule can be checked without randomness.
    pub fn delay_with_jitter(&self, attempt: u32, sample: f64) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(attempt));
        let capped = exp.min(self.cap);
        let j = sample.clamp(0.0, 1.0) * self.jitter;
        Duration::from_secs_f64(capped.as_secs_f64() * (1.0 + j))
    }

    /// The next delay, or `None` once `max_attempts` delays have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let sample = rand::thread_rng().gen_range(0.0..=1.0);
        self.next_delay_with(sample)
    }

    pub fn next_delay_with(&mut self, sample: f64) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.delay_with_jitter(self.attempt, sample);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Call after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Worst case for any single delay.
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.cap.as_secs_f64() * (1.0 + self.jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.25, 10)
    }

    #[test]
    fn doubles_until_the_cap() {
        let b = backoff();
        let delays: Vec<u64> = (0..7).map(|a| b.delay_with_jitter(a, 0.0).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn non_decreasing_and_bounded_for_any_fixed_sample() {
        let b = backoff();
        for sample in [0.0, 0.1, 0.5, 0.9, 1.0] {
            let mut previous = Duration::ZERO;
            for attempt in 0..40 {
                let delay = b.delay_with_jitter(attempt, sample);
                assert!(delay >= previous, "attempt {} sample {}", attempt, sample);
                assert!(delay.as_secs_f64() <= 30.0 * 1.25 + 1e-9);
                previous = delay;
            }
        }
    }

    #[test]
    fn random_delays_stay_within_jitter_band() {
        let mut b = backoff();
        for attempt in 0..10 {
            let delay = b.next_delay().unwrap().as_secs_f64();
            let floor = (2f64.powi(attempt)).min(30.0);
            assert!(delay >= floor && delay <= floor * 1.25 + 1e-9, "delay was {}", delay);
        }
    }

    #[test]
    fn exhausts_after_max_attempts_and_resets() {
        let mut b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.0, 2);
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.is_exhausted());
        assert_eq!(b.next_delay(), None);

        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn negative_jitter_is_clamped() {
        let b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), -0.5, 3);
        assert_eq!(b.delay_with_jitter(0, 1.0), Duration::from_secs(1));
    }

    #[test]
    fn oversized_jitter_is_capped_at_a_quarter() {
        let b = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 1e300, 3);
        assert_eq!(b.delay_with_jitter(0, 1.0), Duration::from_millis(1250));
        assert_eq!(b.max_delay(), Duration::from_millis(37_500));
    }
}
