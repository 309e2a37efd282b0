//! Handler failure bookkeeping and in-place retries of transient errors.

use crate::config::AgentConfig;
use crate::error::Result;
use crate::model::{PollPhase, PollState};
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

const MAX_ERROR_LEN: usize = 200;
const TRANSIENT_ATTEMPTS: usize = 5;

/// Growth of the poll period after a failed handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub increase_rate: i64,
    pub max_new_period_secs: i64,
    pub max_update_period_secs: i64,
}

impl RetryPolicy {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            increase_rate: config.poll_period_increase_rate.max(1),
            max_new_period_secs: config.max_new_poll_period_secs,
            max_update_period_secs: config.max_update_poll_period_secs,
        }
    }

    /// Count a failure in `phase` and back off that phase's poll period.
    /// Returns `true` once the retry ceiling is reached; a ceiling of 0
    /// never is.
    pub fn on_error(&self, poll: &mut PollState, phase: PollPhase) -> bool {
        let (retries, max, period, cap) = match phase {
            PollPhase::New => (
                &mut poll.new_retries,
                poll.max_new_retries,
                &mut poll.new_poll_period_secs,
                self.max_new_period_secs,
            ),
            PollPhase::Update => (
                &mut poll.update_retries,
                poll.max_update_retries,
                &mut poll.update_poll_period_secs,
                self.max_update_period_secs,
            ),
        };
        *retries += 1;
        *period = period.saturating_mul(self.increase_rate).min(cap);
        max > 0 && *retries >= max
    }
}

/// `{key: {"msg": ...}}` with the message cut to 200 characters.
pub fn error_entry(key: &str, error: &dyn std::fmt::Display) -> Value {
    let msg: String = error.to_string().chars().take(MAX_ERROR_LEN).collect();
    json!({ key: { "msg": msg } })
}

fn backoff(attempt: usize) -> Duration {
    let ceiling = match attempt {
        0 => 10,
        1 => 60,
        _ => 120,
    };
    Duration::from_secs(fastrand::u64(1..=ceiling))
}

/// Run `op`, retrying transient failures (deadlocks, serialization
/// conflicts, broker timeouts) with randomized sleeps.
pub async fn retry_transient<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt + 1 < TRANSIENT_ATTEMPTS => {
                let pause = backoff(attempt);
                warn!(what, attempt, ?pause, "transient error, retrying: {e}");
                tokio::time::sleep(pause).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            increase_rate: 2,
            max_new_period_secs: 50,
            max_update_period_secs: 600,
        }
    }

    #[test]
    fn backs_off_until_the_ceiling() {
        let mut poll = PollState::new(3, 0, 10);
        assert!(!policy().on_error(&mut poll, PollPhase::New));
        assert_eq!(poll.new_poll_period_secs, 20);
        assert!(!policy().on_error(&mut poll, PollPhase::New));
        assert_eq!(poll.new_poll_period_secs, 40);
        assert!(policy().on_error(&mut poll, PollPhase::New));
        assert_eq!(poll.new_poll_period_secs, 50);
        assert_eq!(poll.new_retries, 3);
        assert_eq!(poll.update_poll_period_secs, 10);
    }

    #[test]
    fn zero_ceiling_is_unlimited() {
        let mut poll = PollState::new(3, 0, 10);
        for _ in 0..20 {
            assert!(!policy().on_error(&mut poll, PollPhase::Update));
        }
        assert_eq!(poll.update_poll_period_secs, 600);
    }

    #[test]
    fn error_messages_are_truncated() {
        let long = "x".repeat(500);
        let entry = error_entry("submit_err", &long);
        assert_eq!(entry["submit_err"]["msg"].as_str().unwrap().len(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let calls = AtomicUsize::new(0);
        let value = retry_transient("test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::BrokerTimeout(Duration::from_secs(1)))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_not() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = retry_transient("test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Other("boom".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
