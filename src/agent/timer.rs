//! Periodic tasks of an agent, ordered by next run time.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::time::Instant;

/// A periodic task. `name` is passed back to the agent when it is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSpec {
    pub name: &'static str,
    pub period: Duration,
    /// Among tasks due at the same instant, higher runs first.
    pub priority: u8,
    /// Skip this run when every worker is busy. Pollers set this so they
    /// do not flood the bus with events nobody can take.
    pub needs_free_workers: bool,
}

impl TimerSpec {
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period,
            priority: 0,
            needs_free_workers: false,
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn poller(mut self) -> Self {
        self.needs_free_workers = true;
        self
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Scheduled {
    at: Instant,
    priority: u8,
    index: usize,
}

impl Ord for Scheduled {
    // BinaryHeap is a max-heap: the earliest, then highest priority, task
    // compares greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then(self.priority.cmp(&other.priority))
            .then(other.index.cmp(&self.index))
    }
}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct TimerQueue {
    specs: Vec<TimerSpec>,
    heap: BinaryHeap<Scheduled>,
}

impl TimerQueue {
    /// Every task is due immediately.
    pub(crate) fn new(specs: Vec<TimerSpec>, now: Instant) -> Self {
        let heap = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| Scheduled {
                at: now,
                priority: spec.priority,
                index,
            })
            .collect();
        Self { specs, heap }
    }

    pub(crate) fn next_at(&self) -> Option<Instant> {
        self.heap.peek().map(|s| s.at)
    }

    /// Pop the next task due at or before `now`.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<usize> {
        if self.heap.peek()?.at > now {
            return None;
        }
        self.heap.pop().map(|s| s.index)
    }

    pub(crate) fn spec(&self, index: usize) -> &TimerSpec {
        &self.specs[index]
    }

    /// Run `index` again one period after `now`.
    pub(crate) fn reschedule(&mut self, index: usize, now: Instant) {
        let spec = &self.specs[index];
        self.heap.push(Scheduled {
            at: now + spec.period,
            priority: spec.priority,
            index,
        });
    }
}
