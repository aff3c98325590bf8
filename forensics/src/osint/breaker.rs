//! Per-source circuit breaker.
//!
//! Three states: *closed* (healthy), *open* (tripped, calls short-circuit),
//! *half-open* (backoff elapsed, one probe allowed). The only path back to
//! closed runs through half-open.

use std::time::{Duration, Instant};

/// Breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time in open before a half-open probe is allowed.
    pub backoff: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            backoff: Duration::from_secs(60),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker for one source. `now` is passed explicitly so breaker
/// behavior is deterministic under test.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    pub fn state(&self, now: Instant) -> CircuitState {
        match self.opened_at {
            None => CircuitState::Closed,
            Some(opened) => {
                if now.duration_since(opened) >= self.config.backoff {
                    CircuitState::HalfOpen
                } else {
                    CircuitState::Open
                }
            }
        }
    }

    /// Whether a call is allowed (closed, or half-open probe).
    pub fn allows(&self, now: Instant) -> bool {
        self.state(now) != CircuitState::Open
    }

    /// Record a successful call. From half-open this closes the circuit.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// Record a failed call. Crossing the threshold opens the circuit; a
    /// failed half-open probe re-opens it with a fresh backoff.
    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        match self.opened_at {
            Some(_) => {
                // Failed probe (or failure while open): restart the backoff.
                self.opened_at = Some(now);
            }
            None => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.opened_at = Some(now);
                }
            }
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, backoff_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            backoff: Duration::from_secs(backoff_secs),
        })
    }

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.state(Instant::now()), CircuitState::Closed);
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = breaker(3, 60);
        let now = Instant::now();
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(now), CircuitState::Closed);
        cb.record_failure(now);
        assert_eq!(cb.state(now), CircuitState::Open);
        assert!(!cb.allows(now));
    }

    #[test]
    fn test_half_open_after_backoff_then_close_on_success() {
        let mut cb = breaker(1, 60);
        let t0 = Instant::now();
        cb.record_failure(t0);
        assert_eq!(cb.state(t0), CircuitState::Open);

        let t1 = t0 + Duration::from_secs(60);
        assert_eq!(cb.state(t1), CircuitState::HalfOpen);
        assert!(cb.allows(t1));

        cb.record_success();
        assert_eq!(cb.state(t1), CircuitState::Closed);
    }

    #[test]
    fn test_failed_probe_reopens() {
        let mut cb = breaker(1, 60);
        let t0 = Instant::now();
        cb.record_failure(t0);
        let t1 = t0 + Duration::from_secs(60);
        assert_eq!(cb.state(t1), CircuitState::HalfOpen);

        cb.record_failure(t1);
        assert_eq!(cb.state(t1), CircuitState::Open);
        // Backoff restarted from the failed probe
        assert_eq!(cb.state(t1 + Duration::from_secs(59)), CircuitState::Open);
        assert_eq!(
            cb.state(t1 + Duration::from_secs(60)),
            CircuitState::HalfOpen
        );
    }

    #[test]
    fn test_never_open_to_closed_directly() {
        // Walk every reachable transition and assert Open never becomes
        // Closed without an intervening HalfOpen observation.
        let mut cb = breaker(1, 10);
        let t0 = Instant::now();
        cb.record_failure(t0);
        assert_eq!(cb.state(t0), CircuitState::Open);
        // Time alone can only reach HalfOpen
        for secs in [1u64, 5, 9, 10, 11, 100] {
            let s = cb.state(t0 + Duration::from_secs(secs));
            assert_ne!(s, CircuitState::Closed);
        }
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut cb = breaker(3, 60);
        let now = Instant::now();
        cb.record_failure(now);
        cb.record_failure(now);
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        cb.record_failure(now);
        assert_eq!(cb.state(now), CircuitState::Closed);
    }
}
