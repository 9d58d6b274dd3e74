//! Per-job-type failure-rate circuit breaker (§4.7 "Failure-rate circuit
//! breaking"), generalized from the teacher's `CircuitBreakerConfig` /
//! `CircuitState` machine. Additive resilience only — it never changes the
//! job lifecycle state machine in §4.6, it just gates new activation.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub window_size: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            window_size: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    pub fn with_success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }

    pub fn with_reset_timeout(mut self, d: Duration) -> Self {
        self.reset_timeout = d;
        self
    }

    pub fn with_window_size(mut self, d: Duration) -> Self {
        self.window_size = d;
        self
    }
}

struct Inner {
    state: CircuitState,
    failures_in_window: VecDeque<DateTime<Utc>>,
    successes_since_half_open: u32,
    opened_at: Option<DateTime<Utc>>,
}

/// One breaker instance per job `type`. `Closed` → `Open` on a failure burst
/// within the window, `Open` → `HalfOpen` after the reset timeout, `HalfOpen`
/// → `Closed` after enough consecutive successes (any failure sends it back
/// to `Open`).
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: parking_lot::Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: parking_lot::Mutex::new(Inner {
                state: CircuitState::Closed,
                failures_in_window: VecDeque::new(),
                successes_since_half_open: 0,
                opened_at: None,
            }),
        }
    }

    pub fn record_failure(&self) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        inner.failures_in_window.push_back(now);
        self.trim_window(&mut inner, now);

        match inner.state {
            CircuitState::HalfOpen => self.trip_open(&mut inner, now),
            CircuitState::Closed if inner.failures_in_window.len() as u32 >= self.config.failure_threshold => {
                self.trip_open(&mut inner, now);
            }
            _ => {}
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.successes_since_half_open += 1;
                if inner.successes_since_half_open >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures_in_window.clear();
                    inner.opened_at = None;
                }
            }
            CircuitState::Closed => {
                inner.failures_in_window.clear();
            }
            CircuitState::Open => {}
        }
    }

    /// Whether new activation should proceed. Transitions `Open` → `HalfOpen`
    /// lazily, on the first check after the reset timeout elapses.
    pub fn allow_request(&self) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if now - opened_at >= chrono::Duration::from_std(self.config.reset_timeout).unwrap_or_default() {
                    inner.state = CircuitState::HalfOpen;
                    inner.successes_since_half_open = 0;
                }
            }
        }
        inner.state != CircuitState::Open
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    fn trip_open(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.successes_since_half_open = 0;
    }

    fn trim_window(&self, inner: &mut Inner, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.config.window_size).unwrap_or_default();
        while let Some(&front) = inner.failures_in_window.front() {
            if now - front > window {
                inner.failures_in_window.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_failure_threshold_within_window() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default().with_failure_threshold(3));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn half_open_closes_after_success_threshold() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(1)
            .with_success_threshold(2)
            .with_reset_timeout(Duration::from_millis(0));
        let breaker = CircuitBreaker::new(config);
        breaker.record_failure();
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn failure_in_half_open_reopens_the_circuit() {
        let config = CircuitBreakerConfig::default().with_failure_threshold(1).with_reset_timeout(Duration::from_millis(0));
        let breaker = CircuitBreaker::new(config);
        breaker.record_failure();
        breaker.allow_request();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
