//! Transform rows.

use super::{POLL_COLUMNS, PollColumns, Probe, parse_column, probe_row, status_names};
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::{Claim, PollQuery};
use chrono::{DateTime, Utc};
use serde_json::Value;

fn columns() -> String {
    format!(
        "transform_id, request_id, name, status, locking, transform_metadata, current_processing_id, \
         errors, {POLL_COLUMNS}, created_at, updated_at, next_poll_at"
    )
}

#[derive(sqlx::FromRow)]
struct TransformRow {
    transform_id: i64,
    request_id: i64,
    name: String,
    status: String,
    locking: String,
    transform_metadata: Value,
    current_processing_id: Option<i64>,
    errors: Option<Value>,
    #[sqlx(flatten)]
    poll: PollColumns,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    next_poll_at: DateTime<Utc>,
}

impl TransformRow {
    fn try_into_transform(self) -> Result<Transform> {
        Ok(Transform {
            transform_id: self.transform_id,
            request_id: self.request_id,
            name: self.name,
            status: parse_column("status", &self.status)?,
            locking: parse_column("locking", &self.locking)?,
            transform_metadata: self.transform_metadata,
            current_processing_id: self.current_processing_id,
            errors: self.errors,
            poll: self.poll.into(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            next_poll_at: self.next_poll_at,
        })
    }
}

impl super::Db {
    pub async fn insert_transform(&self, new: NewTransform) -> Result<Transform> {
        let row: TransformRow = sqlx::query_as(&format!(
            "INSERT INTO transforms
                (request_id, name, transform_metadata,
                 max_new_retries, max_update_retries, new_poll_period, update_poll_period)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {}",
            columns()
        ))
        .bind(new.request_id)
        .bind(&new.name)
        .bind(&new.transform_metadata)
        .bind(new.poll.max_new_retries)
        .bind(new.poll.max_update_retries)
        .bind(new.poll.new_poll_period_secs)
        .bind(new.poll.update_poll_period_secs)
        .fetch_one(&self.pool)
        .await?;
        row.try_into_transform()
    }

    pub async fn get_transform(&self, transform_id: i64) -> Result<Transform> {
        let row: Option<TransformRow> =
            sqlx::query_as(&format!("SELECT {} FROM transforms WHERE transform_id = $1", columns()))
                .bind(transform_id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("transform {transform_id}")))?
            .try_into_transform()
    }

    pub async fn transforms_of_request(&self, request_id: i64) -> Result<Vec<Transform>> {
        let rows: Vec<TransformRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transforms WHERE request_id = $1 ORDER BY transform_id",
            columns()
        ))
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TransformRow::try_into_transform).collect()
    }

    pub async fn transforms_for_poll(&self, query: &PollQuery<TransformStatus>) -> Result<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT transform_id FROM transforms
             WHERE status = ANY($1) AND locking = 'idle' AND next_poll_at <= now()
               AND ($2::bigint IS NULL OR request_id >= $2)
             ORDER BY updated_at ASC
             LIMIT $3",
        )
        .bind(status_names(&query.statuses))
        .bind(query.min_request_id)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    pub async fn lock_transform(
        &self,
        transform_id: i64,
        statuses: &[TransformStatus],
    ) -> Result<Claim<Transform>> {
        let mut tx = self.pool.begin().await?;
        let status = match probe_row(&mut *tx, "transforms", "transform_id", transform_id).await? {
            Probe::Missing => return Err(Error::NotFound(format!("transform {transform_id}"))),
            Probe::Busy => return Ok(Claim::Busy),
            Probe::Idle { status } => parse_column::<TransformStatus>("status", &status)?,
        };
        if !statuses.contains(&status) {
            return Ok(Claim::Ineligible);
        }
        let row: TransformRow = sqlx::query_as(&format!(
            "UPDATE transforms SET locking = 'locking', updated_at = now()
             WHERE transform_id = $1
             RETURNING {}",
            columns()
        ))
        .bind(transform_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Claim::Claimed(row.try_into_transform()?))
    }

    pub async fn update_transform(&self, update: &TransformUpdate) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row: Option<TransformRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transforms WHERE transform_id = $1 FOR UPDATE",
            columns()
        ))
        .bind(update.transform_id)
        .fetch_optional(&mut *tx)
        .await?;
        let mut transform = row
            .ok_or_else(|| Error::NotFound(format!("transform {}", update.transform_id)))?
            .try_into_transform()?;
        transform.apply(update, Utc::now());

        sqlx::query(
            "UPDATE transforms SET
                status = $2, locking = $3, current_processing_id = $4, errors = $5,
                new_retries = $6, update_retries = $7, max_new_retries = $8, max_update_retries = $9,
                new_poll_period = $10, update_poll_period = $11,
                updated_at = $12, next_poll_at = $13
             WHERE transform_id = $1",
        )
        .bind(transform.transform_id)
        .bind(transform.status.to_string())
        .bind(transform.locking.to_string())
        .bind(transform.current_processing_id)
        .bind(&transform.errors)
        .bind(transform.poll.new_retries)
        .bind(transform.poll.update_retries)
        .bind(transform.poll.max_new_retries)
        .bind(transform.poll.max_update_retries)
        .bind(transform.poll.new_poll_period_secs)
        .bind(transform.poll.update_poll_period_secs)
        .bind(transform.updated_at)
        .bind(transform.next_poll_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}
