//! Agent heartbeats.

use crate::error::Result;
use crate::model::Heartbeat;
use chrono::{DateTime, Utc};

impl super::Db {
    pub async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        sqlx::query(
            "INSERT INTO health (agent, hostname, pid, thread_id, payload, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (agent, hostname, pid, thread_id)
             DO UPDATE SET payload = EXCLUDED.payload, updated_at = EXCLUDED.updated_at",
        )
        .bind(&heartbeat.agent)
        .bind(&heartbeat.hostname)
        .bind(heartbeat.pid as i32)
        .bind(&heartbeat.thread_id)
        .bind(&heartbeat.payload)
        .bind(heartbeat.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clean_heartbeats(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM health WHERE updated_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }
}
