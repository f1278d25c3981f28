use crate::config::types::CircuitBreakerConfig;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Three-state guard around the storage sink, owned by one flush engine.
/// Time is passed in so transitions are deterministic under test.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_duration: Duration,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// First failure since the last success
    failing_since: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            open_duration: config.open_duration,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            failing_since: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Advance Open to HalfOpen once the open period has elapsed.
    pub fn poll(&mut self, now: Instant) -> CircuitState {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if now.saturating_duration_since(opened_at) >= self.open_duration {
                    self.state = CircuitState::HalfOpen;
                }
            }
        }
        self.state
    }

    /// Returns true when this success closed a breaker that was not closed.
    pub fn record_success(&mut self) -> bool {
        let recovered = self.state != CircuitState::Closed;
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.failing_since = None;
        recovered
    }

    /// Returns true when this failure opened the breaker.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.failing_since.get_or_insert(now);

        match self.poll(now) {
            CircuitState::Closed if self.consecutive_failures >= self.failure_threshold => {
                self.open(now);
                true
            }
            CircuitState::Closed => false,
            CircuitState::HalfOpen => {
                self.open(now);
                true
            }
            CircuitState::Open => {
                self.opened_at = Some(now);
                false
            }
        }
    }

    pub fn force_open(&mut self, now: Instant) {
        self.failing_since.get_or_insert(now);
        self.open(now);
    }

    /// Time since the sink started failing; zero while healthy.
    pub fn downtime(&self, now: Instant) -> Duration {
        self.failing_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or(Duration::ZERO)
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold: 5,
            open_duration: Duration::from_secs(120),
            max_downtime: Duration::from_secs(300),
        })
    }

    #[test]
    fn test_threshold_failures_open() {
        let mut cb = breaker();
        let now = Instant::now();

        for _ in 0..4 {
            assert!(!cb.record_failure(now));
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(cb.record_failure(now));
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut cb = breaker();
        let now = Instant::now();
        for _ in 0..4 {
            cb.record_failure(now);
        }
        assert!(!cb.record_success());
        assert_eq!(cb.consecutive_failures(), 0);

        for _ in 0..4 {
            cb.record_failure(now);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_becomes_half_open_after_duration() {
        let mut cb = breaker();
        let start = Instant::now();
        cb.force_open(start);

        assert_eq!(cb.poll(start + Duration::from_secs(119)), CircuitState::Open);
        assert_eq!(cb.poll(start + Duration::from_secs(120)), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_success_closes() {
        let mut cb = breaker();
        let start = Instant::now();
        cb.force_open(start);
        cb.poll(start + Duration::from_secs(121));

        assert!(cb.record_success());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.downtime(start + Duration::from_secs(500)), Duration::ZERO);
    }

    #[test]
    fn test_half_open_failure_reopens_and_resets_timer() {
        let mut cb = breaker();
        let start = Instant::now();
        cb.force_open(start);

        let probe = start + Duration::from_secs(130);
        assert_eq!(cb.poll(probe), CircuitState::HalfOpen);
        assert!(cb.record_failure(probe));
        assert_eq!(cb.state(), CircuitState::Open);

        // Timer restarted at the probe
        assert_eq!(cb.poll(probe + Duration::from_secs(119)), CircuitState::Open);
        assert_eq!(cb.poll(probe + Duration::from_secs(120)), CircuitState::HalfOpen);
    }

    #[test]
    fn test_downtime_counts_from_first_failure() {
        let mut cb = breaker();
        let start = Instant::now();
        assert_eq!(cb.downtime(start + Duration::from_secs(1000)), Duration::ZERO);

        cb.record_failure(start);
        cb.record_failure(start + Duration::from_secs(10));
        assert_eq!(cb.downtime(start + Duration::from_secs(60)), Duration::from_secs(60));
    }
}
