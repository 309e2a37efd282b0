//! The durable event queue: merge-on-insert, prioritized claiming, archive.

use crate::error::{Error, Result};
use crate::model::{Event, EventStatus, EventType};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Priority given to a key that has never been processed: one week, so it
/// sorts ahead of anything processed recently.
const UNSEEN_PRIORITY_SECS: i64 = 7 * 24 * 3600;

/// Result of adding an event to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddedEvent {
    Inserted,
    Merged,
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    event_id: i64,
    priority: i64,
    content: serde_json::Value,
}

impl super::Db {
    /// Queue an event, merging it into a pending event with the same type
    /// and subject when there is one.
    pub async fn add_event(&self, event: &Event) -> Result<AddedEvent> {
        let mut tx = self.pool.begin().await?;
        let event_type = event.event_type.code();
        let actual_id = event.actual_id();

        let pending: Option<(i64, serde_json::Value)> = sqlx::query_as(
            "SELECT event_id, content FROM events
             WHERE event_type = $1 AND event_actual_id = $2 AND status = 'new'
             ORDER BY event_id
             LIMIT 1
             FOR UPDATE",
        )
        .bind(event_type)
        .bind(actual_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((event_id, content)) = pending {
            let mut queued: Event = serde_json::from_value(content)?;
            if queued.merge(event.clone()) {
                sqlx::query("UPDATE events SET content = $1, event_counter = $2 WHERE event_id = $3")
                    .bind(serde_json::to_value(&queued)?)
                    .bind(queued.counter as i32)
                    .bind(event_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                return Ok(AddedEvent::Merged);
            }
        }

        let last_processed: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT last_processed_at FROM events_priority
             WHERE event_type = $1 AND event_actual_id = $2",
        )
        .bind(event_type)
        .bind(actual_id)
        .fetch_optional(&mut *tx)
        .await?;
        let priority = match last_processed {
            Some((at,)) => (Utc::now() - at).num_seconds().max(0),
            None => UNSEEN_PRIORITY_SECS,
        };

        sqlx::query(
            "INSERT INTO events (event_uuid, event_type, event_actual_id, priority, status, event_counter, content)
             VALUES ($1, $2, $3, $4, 'new', $5, $6)
             ON CONFLICT (event_uuid) DO NOTHING",
        )
        .bind(event.id)
        .bind(event_type)
        .bind(actual_id)
        .bind(priority)
        .bind(event.counter as i32)
        .bind(serde_json::to_value(event)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(AddedEvent::Inserted)
    }

    /// Claim up to `limit` pending events of one type, highest priority
    /// first. Claimed rows move to `processing`; concurrent claimers skip
    /// rows locked by each other.
    pub async fn claim_events(&self, event_type: EventType, limit: i64) -> Result<Vec<Event>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;

        let mut rows: Vec<ClaimedRow> = sqlx::query_as(
            "WITH claimable AS (
                SELECT event_id FROM events
                WHERE event_type = $1 AND status = 'new'
                ORDER BY priority DESC, event_id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
             )
             UPDATE events e
             SET status = 'processing', processing_at = now()
             FROM claimable
             WHERE e.event_id = claimable.event_id
             RETURNING e.event_id, e.priority, e.content",
        )
        .bind(event_type.code())
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;
        rows.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.event_id.cmp(&b.event_id)));

        let events = rows
            .into_iter()
            .map(|row| serde_json::from_value::<Event>(row.content).map_err(Error::from))
            .collect::<Result<Vec<_>>>()?;

        let mut keys: Vec<i64> = events.iter().map(Event::actual_id).collect();
        keys.sort_unstable();
        keys.dedup();
        if !keys.is_empty() {
            sqlx::query(
                "INSERT INTO events_priority (event_type, event_actual_id, last_processed_at)
                 SELECT $1, key, now() FROM unnest($2::bigint[]) AS key
                 ON CONFLICT (event_type, event_actual_id)
                 DO UPDATE SET last_processed_at = EXCLUDED.last_processed_at",
            )
            .bind(event_type.code())
            .bind(&keys)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(events)
    }

    /// Remove a handled event from the queue, archiving it with `status`
    /// when `to_archive` is set. Unknown events are ignored.
    pub async fn finish_event(&self, id: Uuid, status: EventStatus, to_archive: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if to_archive {
            sqlx::query(
                "WITH removed AS (
                    DELETE FROM events WHERE event_uuid = $1 RETURNING *
                 )
                 INSERT INTO events_archive
                    (event_id, event_uuid, event_type, event_actual_id, priority, status,
                     event_counter, content, created_at, processing_at, processed_at)
                 SELECT event_id, event_uuid, event_type, event_actual_id, priority, $2,
                        event_counter, content, created_at, processing_at, now()
                 FROM removed",
            )
            .bind(id)
            .bind(status.to_string())
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("DELETE FROM events WHERE event_uuid = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Return events stuck in `processing` since before `older_than` to
    /// the queue. Their handler is presumed dead.
    pub async fn reclaim_stale_events(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let rows = sqlx::query(
            "UPDATE events SET status = 'new', processing_at = NULL
             WHERE status = 'processing' AND processing_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows)
    }

    /// Number of queued events of a type in a status.
    pub async fn count_events(&self, event_type: EventType, status: EventStatus) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT count(*) FROM events WHERE event_type = $1 AND status = $2")
                .bind(event_type.code())
                .bind(status.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
