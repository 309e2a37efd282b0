//! In-process backend that merges and orders events.
//!
//! Per event type the queue keeps at most one pending event per subject:
//! a new event for a subject that is already queued is merged into the
//! queued one. New events are placed by how recently their subject was
//! last dispatched, so that a busy subject cannot starve quiet ones:
//!
//! * a subject never dispatched before goes to the front,
//! * otherwise the event walks backwards from the tail past events whose
//!   subjects were dispatched more recently than its own, stopping at the
//!   first event with no dispatch history, one that has already waited
//!   longer than `max_delay`, or one whose subject is staler.

use super::EventBusBackend;
use crate::error::Result;
use crate::model::{Event, EventType};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

struct Pending {
    event: Event,
    inserted_at: Instant,
}

/// What `insert` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    Queued,
    Merged,
}

#[derive(Default)]
struct TypeQueue {
    order: VecDeque<Uuid>,
    pending: HashMap<Uuid, Pending>,
    by_key: HashMap<i64, Vec<Uuid>>,
    /// When each subject was last handed out.
    history: HashMap<i64, Instant>,
}

impl TypeQueue {
    fn insert(&mut self, event: Event, now: Instant, max_delay: Duration) -> Inserted {
        let key = event.actual_id();

        if let Some(ids) = self.by_key.get_mut(&key) {
            ids.retain(|id| self.pending.contains_key(id));
            for id in ids.iter() {
                if let Some(queued) = self.pending.get_mut(id) {
                    if queued.event.able_to_merge(&event) {
                        queued.event.merge(event);
                        return Inserted::Merged;
                    }
                }
            }
        }

        let id = event.id;
        match self.history.get(&key).copied() {
            None => self.order.push_front(id),
            Some(dispatched_at) => {
                let mut loc = self.order.len();
                for queued_id in self.order.iter().rev() {
                    let Some(queued) = self.pending.get(queued_id) else {
                        break;
                    };
                    let Some(&queued_dispatched_at) = self.history.get(&queued.event.actual_id())
                    else {
                        break;
                    };
                    if queued.inserted_at + max_delay < now {
                        break;
                    }
                    if queued_dispatched_at > dispatched_at {
                        loc -= 1;
                    } else {
                        break;
                    }
                }
                self.order.insert(loc, id);
            }
        }

        self.by_key.entry(key).or_default().push(id);
        self.pending.insert(
            id,
            Pending {
                event,
                inserted_at: now,
            },
        );
        Inserted::Queued
    }

    fn take(&mut self, num_events: usize, now: Instant) -> Vec<Event> {
        let mut events = Vec::with_capacity(num_events.min(self.order.len()));
        while events.len() < num_events {
            let Some(id) = self.order.pop_front() else {
                break;
            };
            let Some(pending) = self.pending.remove(&id) else {
                continue;
            };
            let key = pending.event.actual_id();
            if let Some(ids) = self.by_key.get_mut(&key) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.by_key.remove(&key);
                }
            }
            self.history.insert(key, now);
            events.push(pending.event);
        }
        events
    }

    /// Forget dispatch history of subjects with nothing queued.
    fn prune(&mut self) {
        self.by_key.retain(|_, ids| {
            ids.retain(|id| self.pending.contains_key(id));
            !ids.is_empty()
        });
        let by_key = &self.by_key;
        self.history.retain(|key, _| by_key.contains_key(key));
    }
}

struct State {
    queues: HashMap<EventType, TypeQueue>,
    last_clean: Instant,
}

pub struct CoalescingBackend {
    state: Mutex<State>,
    arrived: Notify,
    max_delay: Duration,
    clean_interval: Duration,
}

impl CoalescingBackend {
    pub fn new(max_delay: Duration, clean_interval: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                queues: HashMap::new(),
                last_clean: Instant::now(),
            }),
            arrived: Notify::new(),
            max_delay,
            clean_interval,
        }
    }

    /// Insert an event, reporting whether it was queued or merged.
    pub async fn insert(&self, event: Event) -> Inserted {
        let event_type = event.event_type;
        let now = Instant::now();
        let inserted = {
            let mut state = self.state.lock().await;
            state
                .queues
                .entry(event_type)
                .or_default()
                .insert(event, now, self.max_delay)
        };
        let counter = match inserted {
            Inserted::Queued => metrics::events_sent(),
            Inserted::Merged => metrics::events_merged(),
        };
        counter.add(
            1,
            &[
                KeyValue::new("backend", "coalescing"),
                KeyValue::new("event_type", event_type.as_str()),
            ],
        );
        if inserted == Inserted::Queued {
            self.arrived.notify_waiters();
        }
        inserted
    }

    pub async fn len(&self, event_type: EventType) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(&event_type)
            .map_or(0, |q| q.order.len())
    }

    /// Drop stale dispatch history, at most once per clean interval.
    pub async fn clean_events(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if now.duration_since(state.last_clean) < self.clean_interval {
            return;
        }
        for queue in state.queues.values_mut() {
            queue.prune();
        }
        state.last_clean = now;
        debug!("coalescing backend pruned dispatch history");
    }

    async fn take(&self, event_type: EventType, num_events: usize) -> Vec<Event> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        match state.queues.get_mut(&event_type) {
            Some(queue) => queue.take(num_events, now),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl EventBusBackend for CoalescingBackend {
    fn name(&self) -> &'static str {
        "coalescing"
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.insert(event).await;
        Ok(())
    }

    async fn get(&self, event_type: EventType, num_events: usize, wait: Duration) -> Result<Vec<Event>> {
        self.clean_events().await;
        if num_events == 0 {
            return Ok(Vec::new());
        }
        let arrived = self.arrived.notified();
        let events = self.take(event_type, num_events).await;
        if !events.is_empty() || wait.is_zero() {
            return Ok(events);
        }
        let _ = tokio::time::timeout(wait, arrived).await;
        Ok(self.take(event_type, num_events).await)
    }

    async fn clean_event(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn fail_event(&self, _event: &Event) -> Result<()> {
        Ok(())
    }
}
