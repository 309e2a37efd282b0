//! Naive in-process backend: one FIFO per event type, no merging.

use super::EventBusBackend;
use crate::error::Result;
use crate::model::{Event, EventType};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
pub struct MemoryBackend {
    queues: Mutex<HashMap<EventType, VecDeque<Event>>>,
    arrived: Notify,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, event_type: EventType) -> usize {
        self.queues
            .lock()
            .await
            .get(&event_type)
            .map_or(0, VecDeque::len)
    }

    async fn pop(&self, event_type: EventType, num_events: usize) -> Vec<Event> {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.get_mut(&event_type) else {
            return Vec::new();
        };
        let n = num_events.min(queue.len());
        queue.drain(..n).collect()
    }
}

#[async_trait]
impl EventBusBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send(&self, event: Event) -> Result<()> {
        metrics::events_sent().add(
            1,
            &[
                KeyValue::new("backend", "memory"),
                KeyValue::new("event_type", event.event_type.as_str()),
            ],
        );
        self.queues
            .lock()
            .await
            .entry(event.event_type)
            .or_default()
            .push_back(event);
        self.arrived.notify_waiters();
        Ok(())
    }

    async fn get(&self, event_type: EventType, num_events: usize, wait: Duration) -> Result<Vec<Event>> {
        if num_events == 0 {
            return Ok(Vec::new());
        }
        let arrived = self.arrived.notified();
        let events = self.pop(event_type, num_events).await;
        if !events.is_empty() || wait.is_zero() {
            return Ok(events);
        }
        let _ = tokio::time::timeout(wait, arrived).await;
        Ok(self.pop(event_type, num_events).await)
    }

    async fn clean_event(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn fail_event(&self, _event: &Event) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_per_event_type() {
        let bus = MemoryBackend::new();
        let first = Event::about(EventType::NewRequest, 1);
        let second = Event::about(EventType::NewRequest, 1);
        bus.send(first.clone()).await.unwrap();
        bus.send(second.clone()).await.unwrap();
        bus.send(Event::about(EventType::NewTransform, 5)).await.unwrap();

        let got = bus.get(EventType::NewRequest, 10, Duration::ZERO).await.unwrap();
        assert_eq!(got, vec![first, second]);
        assert_eq!(bus.len(EventType::NewTransform).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn get_waits_for_a_send() {
        let bus = std::sync::Arc::new(MemoryBackend::new());
        let sender = std::sync::Arc::clone(&bus);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            sender.send(Event::about(EventType::Test, 1)).await.unwrap();
        });

        let got = bus.get(EventType::Test, 1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.len(), 1);
    }
}
