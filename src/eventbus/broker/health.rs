//! Failure accounting for the broker client.
//!
//! Consecutive failures and timeouts are counted; any successful exchange
//! resets both. Crossing a threshold declares the broker failed, which the
//! event bus uses to switch to its local fallback. A failed broker stays
//! failed for the whole `failure_timeout`, whatever the probes in between
//! report; only then is it tried again, a limited number of times.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub timeout_threshold: u32,
    pub failure_timeout: Duration,
    pub max_recoveries: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_threshold: 5,
            failure_timeout: Duration::from_secs(180),
            max_recoveries: 10,
        }
    }
}

#[derive(Debug)]
pub struct BrokerHealth {
    policy: HealthPolicy,
    num_failures: u32,
    num_timeouts: u32,
    failed_at: Option<Instant>,
    recoveries: u32,
}

impl BrokerHealth {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            num_failures: 0,
            num_timeouts: 0,
            failed_at: None,
            recoveries: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.num_failures = 0;
        self.num_timeouts = 0;
    }

    pub fn record_failure(&mut self) {
        self.num_failures += 1;
    }

    pub fn record_timeout(&mut self) {
        self.num_timeouts += 1;
    }

    pub fn num_failures(&self) -> u32 {
        self.num_failures
    }

    pub fn num_timeouts(&self) -> u32 {
        self.num_timeouts
    }

    pub fn has_errors(&self) -> bool {
        self.num_failures > 0 || self.num_timeouts > 0
    }

    /// Whether the broker should be used right now.
    pub fn is_ok(&mut self, now: Instant) -> bool {
        if let Some(failed_at) = self.failed_at {
            if self.recoveries < self.policy.max_recoveries
                && now.duration_since(failed_at) >= self.policy.failure_timeout
            {
                self.failed_at = None;
                self.num_failures = 0;
                self.num_timeouts = 0;
                return true;
            }
            return false;
        }
        if self.num_failures > self.policy.failure_threshold
            || self.num_timeouts > self.policy.timeout_threshold
        {
            if self.failed_at.is_none() {
                self.failed_at = Some(now);
                self.recoveries += 1;
            }
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> HealthPolicy {
        HealthPolicy {
            failure_threshold: 2,
            timeout_threshold: 2,
            failure_timeout: Duration::from_secs(60),
            max_recoveries: 2,
        }
    }

    #[test]
    fn tolerates_failures_up_to_threshold() {
        let mut health = BrokerHealth::new(policy());
        let now = Instant::now();
        health.record_failure();
        health.record_failure();
        assert!(health.is_ok(now));
        health.record_failure();
        assert!(!health.is_ok(now));
    }

    #[test]
    fn success_resets_counters() {
        let mut health = BrokerHealth::new(policy());
        for _ in 0..2 {
            health.record_timeout();
        }
        health.record_success();
        health.record_timeout();
        assert!(health.is_ok(Instant::now()));
    }

    #[test]
    fn recovers_after_failure_timeout() {
        let mut health = BrokerHealth::new(policy());
        let t0 = Instant::now();
        for _ in 0..3 {
            health.record_timeout();
        }
        assert!(!health.is_ok(t0));
        assert!(!health.is_ok(t0 + Duration::from_secs(59)));
        assert!(health.is_ok(t0 + Duration::from_secs(60)));
        assert!(!health.has_errors());
    }

    #[test]
    fn gives_up_after_max_recoveries() {
        let mut health = BrokerHealth::new(policy());
        let mut now = Instant::now();
        for _ in 0..3 {
            health.record_failure();
        }
        assert!(!health.is_ok(now));
        now += Duration::from_secs(61);
        assert!(health.is_ok(now));

        for _ in 0..3 {
            health.record_failure();
        }
        assert!(!health.is_ok(now));
        assert!(!health.is_ok(now + Duration::from_secs(61)));
        assert!(!health.is_ok(now + Duration::from_secs(3600)));
    }

    #[test]
    fn stays_failed_until_timeout_even_after_success() {
        let mut health = BrokerHealth::new(policy());
        let t0 = Instant::now();
        for _ in 0..3 {
            health.record_failure();
        }
        assert!(!health.is_ok(t0));

        health.record_success();
        assert!(!health.is_ok(t0 + Duration::from_secs(1)));
        assert!(!health.is_ok(t0 + Duration::from_secs(59)));
        assert!(health.is_ok(t0 + Duration::from_secs(60)));
    }
}
