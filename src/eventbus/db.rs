//! Backend over the `events` table.

use super::EventBusBackend;
use crate::db::Db;
use crate::db::events::AddedEvent;
use crate::error::Result;
use crate::model::{Event, EventStatus, EventType};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// How often an empty `get` re-checks the table while waiting.
const RECHECK_INTERVAL: Duration = Duration::from_millis(500);

pub struct DbBackend {
    db: Arc<Db>,
    to_archive: bool,
    /// Events claimed longer ago than this are handed out again.
    processing_lease: Duration,
    last_reclaim: Mutex<Instant>,
}

impl DbBackend {
    pub fn new(db: Arc<Db>, to_archive: bool) -> Self {
        Self {
            db,
            to_archive,
            processing_lease: Duration::from_secs(3600),
            last_reclaim: Mutex::new(Instant::now()),
        }
    }

    pub fn processing_lease(mut self, lease: Duration) -> Self {
        self.processing_lease = lease;
        self
    }

    /// Put events whose consumer vanished back in the queue, at most once
    /// per quarter lease.
    async fn reclaim_if_due(&self) {
        {
            let mut last = self.last_reclaim.lock().unwrap_or_else(PoisonError::into_inner);
            if last.elapsed() < self.processing_lease / 4 {
                return;
            }
            *last = Instant::now();
        }
        let lease = chrono::Duration::from_std(self.processing_lease).unwrap_or(chrono::Duration::hours(1));
        match self.db.reclaim_stale_events(Utc::now() - lease).await {
            Ok(0) => {}
            Ok(reclaimed) => warn!(reclaimed, "reclaimed events from vanished consumers"),
            Err(e) => warn!("cannot reclaim stale events: {e}"),
        }
    }
}

#[async_trait]
impl EventBusBackend for DbBackend {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn send(&self, event: Event) -> Result<()> {
        let added = self.db.add_event(&event).await?;
        let counter = match added {
            AddedEvent::Inserted => metrics::events_sent(),
            AddedEvent::Merged => metrics::events_merged(),
        };
        counter.add(
            1,
            &[
                KeyValue::new("backend", "database"),
                KeyValue::new("event_type", event.event_type.as_str()),
            ],
        );
        Ok(())
    }

    async fn get(&self, event_type: EventType, num_events: usize, wait: Duration) -> Result<Vec<Event>> {
        self.reclaim_if_due().await;
        let limit = num_events as i64;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let events = self.db.claim_events(event_type, limit).await?;
            let now = tokio::time::Instant::now();
            if !events.is_empty() || now >= deadline {
                return Ok(events);
            }
            tokio::time::sleep(RECHECK_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn clean_event(&self, event: &Event) -> Result<()> {
        self.db
            .finish_event(event.id, EventStatus::Processed, self.to_archive)
            .await
    }

    async fn fail_event(&self, event: &Event) -> Result<()> {
        self.db
            .finish_event(event.id, EventStatus::Failed, self.to_archive)
            .await
    }
}
