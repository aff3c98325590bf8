//! Per-source request quota with rolling windows.

use std::time::{Duration, Instant};

/// Tracks requests against a source's per-minute and per-hour limits.
///
/// Windows roll from the first request inside them. Methods take `now`
/// explicitly so quota behavior is deterministic under test.
#[derive(Debug, Clone)]
pub struct QuotaState {
    rpm_limit: u32,
    rph_limit: u32,
    minute_start: Option<Instant>,
    requests_this_minute: u32,
    hour_start: Option<Instant>,
    requests_this_hour: u32,
    blocked_until: Option<Instant>,
}

impl QuotaState {
    pub fn new(rpm_limit: u32, rph_limit: u32) -> Self {
        Self {
            rpm_limit,
            rph_limit,
            minute_start: None,
            requests_this_minute: 0,
            hour_start: None,
            requests_this_hour: 0,
            blocked_until: None,
        }
    }

    fn roll(&mut self, now: Instant) {
        if let Some(start) = self.minute_start {
            if now.duration_since(start) >= Duration::from_secs(60) {
                self.minute_start = None;
                self.requests_this_minute = 0;
            }
        }
        if let Some(start) = self.hour_start {
            if now.duration_since(start) >= Duration::from_secs(3600) {
                self.hour_start = None;
                self.requests_this_hour = 0;
            }
        }
        if let Some(until) = self.blocked_until {
            if now >= until {
                self.blocked_until = None;
            }
        }
    }

    /// Whether a request is permitted right now. Does not count it.
    pub fn permits(&mut self, now: Instant) -> bool {
        self.roll(now);
        if self.blocked_until.is_some() {
            return false;
        }
        self.requests_this_minute < self.rpm_limit && self.requests_this_hour < self.rph_limit
    }

    /// Count one executed request.
    pub fn record(&mut self, now: Instant) {
        self.roll(now);
        if self.minute_start.is_none() {
            self.minute_start = Some(now);
        }
        if self.hour_start.is_none() {
            self.hour_start = Some(now);
        }
        self.requests_this_minute += 1;
        self.requests_this_hour += 1;
    }

    /// Block the source until `now + backoff` (e.g. after an upstream 429).
    pub fn block_for(&mut self, now: Instant, backoff: Duration) {
        self.blocked_until = Some(now + backoff);
    }

    pub fn requests_this_minute(&self) -> u32 {
        self.requests_this_minute
    }

    pub fn requests_this_hour(&self) -> u32 {
        self.requests_this_hour
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpm_limit_enforced() {
        let mut quota = QuotaState::new(1, 100);
        let t0 = Instant::now();
        assert!(quota.permits(t0));
        quota.record(t0);
        // Four more back-to-back attempts inside the same second
        for i in 1..5u64 {
            let t = t0 + Duration::from_millis(i * 100);
            assert!(!quota.permits(t));
        }
        assert_eq!(quota.requests_this_minute(), 1);
    }

    #[test]
    fn test_minute_window_rolls() {
        let mut quota = QuotaState::new(1, 100);
        let t0 = Instant::now();
        quota.record(t0);
        assert!(!quota.permits(t0 + Duration::from_secs(59)));
        assert!(quota.permits(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn test_rph_limit_enforced() {
        let mut quota = QuotaState::new(100, 2);
        let t0 = Instant::now();
        quota.record(t0);
        quota.record(t0 + Duration::from_secs(61));
        // Minute window rolled, hour window did not
        assert!(!quota.permits(t0 + Duration::from_secs(122)));
        assert!(quota.permits(t0 + Duration::from_secs(3600)));
    }

    #[test]
    fn test_blocked_until() {
        let mut quota = QuotaState::new(10, 100);
        let t0 = Instant::now();
        quota.block_for(t0, Duration::from_secs(30));
        assert!(!quota.permits(t0 + Duration::from_secs(29)));
        assert!(quota.permits(t0 + Duration::from_secs(30)));
    }
}
