//! State shared by every agent in a process: the lowest request id still
//! being worked on, used to narrow poller queries.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Pollers re-scan below the known minimum this often while the process
/// is young...
const WIDEN_EVERY_EARLY: u64 = 30;
/// ...and this often afterwards.
const WIDEN_EVERY: u64 = 180;
const EARLY_PHASE: Duration = Duration::from_secs(3600);
const WIDEN_BY: i64 = 1000;
const SEEN_TTL: Duration = Duration::from_secs(12 * 3600);

#[derive(Default)]
struct State {
    min_request_id: Option<i64>,
    seen: HashMap<i64, Instant>,
    polls: HashMap<&'static str, u64>,
}

pub struct AgentContext {
    started: Instant,
    state: Mutex<State>,
}

impl AgentContext {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn min_request_id(&self) -> Option<i64> {
        self.state().min_request_id
    }

    /// Lower bound for the next query of `poller`. Every so often the
    /// bound is widened so that requests below the minimum are not missed.
    pub fn window_floor(&self, poller: &'static str) -> Option<i64> {
        let every = if self.started.elapsed() < EARLY_PHASE {
            WIDEN_EVERY_EARLY
        } else {
            WIDEN_EVERY
        };
        let mut state = self.state();
        let count = state.polls.entry(poller).or_insert(0);
        let widen = *count % every == 0;
        *count += 1;
        let min = state.min_request_id?;
        Some(if widen { min - WIDEN_BY } else { min })
    }

    /// Record that a poller produced `request_id`.
    pub fn observe(&self, request_id: i64) {
        let mut state = self.state();
        state.seen.insert(request_id, Instant::now());
        if state.min_request_id.is_none_or(|min| request_id < min) {
            state.min_request_id = Some(request_id);
            info!(min_request_id = request_id, "new min_request_id");
        }
    }

    /// Forget requests not seen for 12 hours and raise the minimum to the
    /// lowest one still seen.
    pub fn clean(&self) {
        let now = Instant::now();
        let mut state = self.state();
        state.seen.retain(|_, at| now.duration_since(*at) < SEEN_TTL);
        if let Some(min) = state.seen.keys().min().copied() {
            state.min_request_id = Some(min);
        }
    }
}

impl Default for AgentContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tracks_the_lowest_request() {
        let ctx = AgentContext::new();
        assert_eq!(ctx.window_floor("new"), None);
        ctx.observe(1500);
        ctx.observe(1200);
        ctx.observe(1800);
        assert_eq!(ctx.min_request_id(), Some(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn widens_periodically() {
        let ctx = AgentContext::new();
        ctx.observe(5000);
        // First poll of a poller widens, the next 29 do not.
        assert_eq!(ctx.window_floor("running"), Some(4000));
        for _ in 1..30 {
            assert_eq!(ctx.window_floor("running"), Some(5000));
        }
        assert_eq!(ctx.window_floor("running"), Some(4000));
        // Counters are per poller.
        assert_eq!(ctx.window_floor("new"), Some(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn clean_forgets_old_requests() {
        let ctx = AgentContext::new();
        ctx.observe(10);
        tokio::time::advance(Duration::from_secs(11 * 3600)).await;
        ctx.observe(20);
        tokio::time::advance(Duration::from_secs(2 * 3600)).await;
        ctx.clean();
        assert_eq!(ctx.min_request_id(), Some(20));
    }
}
