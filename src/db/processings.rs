//! Processing rows.

use super::{POLL_COLUMNS, PollColumns, Probe, parse_column, probe_row, status_names};
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::{Claim, PollQuery};
use chrono::{DateTime, Utc};
use serde_json::Value;

fn columns() -> String {
    format!(
        "processing_id, transform_id, request_id, status, locking, workload_id, processing_metadata, \
         polling_retries, errors, {POLL_COLUMNS}, submitted_at, created_at, updated_at, next_poll_at"
    )
}

#[derive(sqlx::FromRow)]
struct ProcessingRow {
    processing_id: i64,
    transform_id: i64,
    request_id: i64,
    status: String,
    locking: String,
    workload_id: Option<String>,
    processing_metadata: Value,
    polling_retries: i32,
    errors: Option<Value>,
    #[sqlx(flatten)]
    poll: PollColumns,
    submitted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    next_poll_at: DateTime<Utc>,
}

impl ProcessingRow {
    fn try_into_processing(self) -> Result<Processing> {
        Ok(Processing {
            processing_id: self.processing_id,
            transform_id: self.transform_id,
            request_id: self.request_id,
            status: parse_column("status", &self.status)?,
            locking: parse_column("locking", &self.locking)?,
            workload_id: self.workload_id,
            processing_metadata: self.processing_metadata,
            polling_retries: self.polling_retries,
            errors: self.errors,
            poll: self.poll.into(),
            submitted_at: self.submitted_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            next_poll_at: self.next_poll_at,
        })
    }
}

impl super::Db {
    pub async fn insert_processing(&self, new: NewProcessing) -> Result<Processing> {
        let row: ProcessingRow = sqlx::query_as(&format!(
            "INSERT INTO processings
                (transform_id, request_id, processing_metadata,
                 max_new_retries, max_update_retries, new_poll_period, update_poll_period)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {}",
            columns()
        ))
        .bind(new.transform_id)
        .bind(new.request_id)
        .bind(&new.processing_metadata)
        .bind(new.poll.max_new_retries)
        .bind(new.poll.max_update_retries)
        .bind(new.poll.new_poll_period_secs)
        .bind(new.poll.update_poll_period_secs)
        .fetch_one(&self.pool)
        .await?;
        row.try_into_processing()
    }

    pub async fn get_processing(&self, processing_id: i64) -> Result<Processing> {
        let row: Option<ProcessingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM processings WHERE processing_id = $1",
            columns()
        ))
        .bind(processing_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| Error::NotFound(format!("processing {processing_id}")))?
            .try_into_processing()
    }

    pub async fn processings_for_poll(&self, query: &PollQuery<ProcessingStatus>) -> Result<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT processing_id FROM processings
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

    pub async fn lock_processing(
        &self,
        processing_id: i64,
        statuses: &[ProcessingStatus],
    ) -> Result<Claim<Processing>> {
        let mut tx = self.pool.begin().await?;
        let status = match probe_row(&mut *tx, "processings", "processing_id", processing_id).await? {
            Probe::Missing => return Err(Error::NotFound(format!("processing {processing_id}"))),
            Probe::Busy => return Ok(Claim::Busy),
            Probe::Idle { status } => parse_column::<ProcessingStatus>("status", &status)?,
        };
        if !statuses.contains(&status) {
            return Ok(Claim::Ineligible);
        }
        let row: ProcessingRow = sqlx::query_as(&format!(
            "UPDATE processings SET locking = 'locking', updated_at = now()
             WHERE processing_id = $1
             RETURNING {}",
            columns()
        ))
        .bind(processing_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Claim::Claimed(row.try_into_processing()?))
    }

    pub async fn update_processing(&self, update: &ProcessingUpdate) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row: Option<ProcessingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM processings WHERE processing_id = $1 FOR UPDATE",
            columns()
        ))
        .bind(update.processing_id)
        .fetch_optional(&mut *tx)
        .await?;
        let mut processing = row
            .ok_or_else(|| Error::NotFound(format!("processing {}", update.processing_id)))?
            .try_into_processing()?;
        processing.apply(update, Utc::now());

        sqlx::query(
            "UPDATE processings SET
                status = $2, locking = $3, workload_id = $4, polling_retries = $5,
                submitted_at = $6, errors = $7,
                new_retries = $8, update_retries = $9, max_new_retries = $10, max_update_retries = $11,
                new_poll_period = $12, update_poll_period = $13,
                updated_at = $14, next_poll_at = $15
             WHERE processing_id = $1",
        )
        .bind(processing.processing_id)
        .bind(processing.status.to_string())
        .bind(processing.locking.to_string())
        .bind(&processing.workload_id)
        .bind(processing.polling_retries)
        .bind(processing.submitted_at)
        .bind(&processing.errors)
        .bind(processing.poll.new_retries)
        .bind(processing.poll.update_retries)
        .bind(processing.poll.max_new_retries)
        .bind(processing.poll.max_update_retries)
        .bind(processing.poll.new_poll_period_secs)
        .bind(processing.poll.update_poll_period_secs)
        .bind(processing.updated_at)
        .bind(processing.next_poll_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}
