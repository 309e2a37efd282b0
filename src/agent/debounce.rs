//! Terminal-status debounce for externally polled processings.
//!
//! Workload systems sometimes report a task as finished and then running
//! again. A processing only goes terminal locally after the same terminal
//! observation has been made on consecutive polls, and never while content
//! updates are still pending.

use crate::model::ProcessingStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalDebounce {
    confirmations: i32,
}

/// What to persist after one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub status: ProcessingStatus,
    pub polling_retries: i32,
}

impl TerminalDebounce {
    pub fn new(confirmations: i32) -> Self {
        Self {
            confirmations: confirmations.max(1),
        }
    }

    /// `polling_retries` is the counter stored on the processing.
    pub fn observe(&self, polling_retries: i32, observed: ProcessingStatus, pending_updates: bool) -> Observation {
        if !observed.is_terminal() {
            return Observation {
                status: observed,
                polling_retries: 0,
            };
        }
        if pending_updates {
            return Observation {
                status: ProcessingStatus::Running,
                polling_retries: 0,
            };
        }
        let seen = polling_retries.saturating_add(1);
        Observation {
            status: if seen >= self.confirmations {
                observed
            } else {
                ProcessingStatus::Running
            },
            polling_retries: seen,
        }
    }
}

impl Default for TerminalDebounce {
    fn default() -> Self {
        Self::new(3)
    }
}
