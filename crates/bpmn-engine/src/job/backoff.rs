//! Exponential backoff with jitter for job retries (§4.6 "Failure"),
//! generalized from the teacher's activity retry policy.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_coefficient: f64,
    /// Fraction of the computed interval to randomize by, e.g. `0.2` = ±20%.
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn exponential(initial_interval: Duration, max_interval: Duration, backoff_coefficient: f64) -> Self {
        Self { initial_interval, max_interval, backoff_coefficient, jitter: 0.2 }
    }

    pub fn fixed(interval: Duration) -> Self {
        Self { initial_interval: interval, max_interval: interval, backoff_coefficient: 1.0, jitter: 0.1 }
    }

    /// `attempt` is 1-based: the first retry after an initial failure is attempt 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
            (capped * factor).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(300), 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_before_the_cap() {
        let policy = RetryPolicy { jitter: 0.0, ..RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(300), 2.0) };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn delay_is_capped_at_max_interval() {
        let policy = RetryPolicy { jitter: 0.0, ..RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(10), 2.0) };
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_the_configured_band() {
        let policy = RetryPolicy::exponential(Duration::from_secs(10), Duration::from_secs(300), 2.0);
        for attempt in 1..5 {
            let delay = policy.delay_for_attempt(attempt).as_secs_f64();
            let base = 10.0 * 2f64.powi((attempt - 1) as i32);
            assert!(delay >= base * 0.79 && delay <= base * 1.21, "delay {delay} out of band for base {base}");
        }
    }
}
