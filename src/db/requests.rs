//! Request rows: insert, list, poll, claim and update.

use super::{POLL_COLUMNS, PollColumns, Probe, parse_column, probe_row, status_names};
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::{Claim, PollQuery};
use chrono::{DateTime, Utc};
use serde_json::Value;

fn columns() -> String {
    format!(
        "request_id, name, requester, request_type, site, priority, status, locking, \
         request_metadata, errors, {POLL_COLUMNS}, created_at, updated_at, next_poll_at, expired_at"
    )
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    request_id: i64,
    name: String,
    requester: String,
    request_type: String,
    site: Option<String>,
    priority: i32,
    status: String,
    locking: String,
    request_metadata: Value,
    errors: Option<Value>,
    #[sqlx(flatten)]
    poll: PollColumns,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    next_poll_at: DateTime<Utc>,
    expired_at: Option<DateTime<Utc>>,
}

impl RequestRow {
    fn try_into_request(self) -> Result<Request> {
        Ok(Request {
            request_id: self.request_id,
            name: self.name,
            requester: self.requester,
            request_type: self.request_type,
            site: self.site,
            priority: self.priority,
            status: parse_column("status", &self.status)?,
            locking: parse_column("locking", &self.locking)?,
            request_metadata: self.request_metadata,
            errors: self.errors,
            poll: self.poll.into(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            next_poll_at: self.next_poll_at,
            expired_at: self.expired_at,
        })
    }
}

impl super::Db {
    pub async fn insert_request(&self, new: NewRequest) -> Result<Request> {
        let row: RequestRow = sqlx::query_as(&format!(
            "INSERT INTO requests
                (name, requester, request_type, site, priority, request_metadata,
                 max_new_retries, max_update_retries, new_poll_period, update_poll_period, expired_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING {}",
            columns()
        ))
        .bind(&new.name)
        .bind(&new.requester)
        .bind(&new.request_type)
        .bind(&new.site)
        .bind(new.priority)
        .bind(&new.request_metadata)
        .bind(new.poll.max_new_retries)
        .bind(new.poll.max_update_retries)
        .bind(new.poll.new_poll_period_secs)
        .bind(new.poll.update_poll_period_secs)
        .bind(new.expired_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into_request()
    }

    pub async fn get_request(&self, request_id: i64) -> Result<Request> {
        let row: Option<RequestRow> =
            sqlx::query_as(&format!("SELECT {} FROM requests WHERE request_id = $1", columns()))
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("request {request_id}")))?
            .try_into_request()
    }

    /// Newest first.
    pub async fn list_requests(&self, status: Option<RequestStatus>, limit: i64) -> Result<Vec<Request>> {
        let rows: Vec<RequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM requests
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY request_id DESC
             LIMIT $2",
            columns()
        ))
        .bind(status.map(|s| s.to_string()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RequestRow::try_into_request).collect()
    }

    pub async fn requests_for_poll(&self, query: &PollQuery<RequestStatus>) -> Result<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as(
            "SELECT request_id FROM requests
             WHERE status = ANY($1) AND locking = 'idle' AND next_poll_at <= now()
               AND ($2::bigint IS NULL OR request_id >= $2)
             ORDER BY priority DESC, updated_at ASC
             LIMIT $3",
        )
        .bind(status_names(&query.statuses))
        .bind(query.min_request_id)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    pub async fn lock_request(&self, request_id: i64, statuses: &[RequestStatus]) -> Result<Claim<Request>> {
        let mut tx = self.pool.begin().await?;
        let status = match probe_row(&mut *tx, "requests", "request_id", request_id).await? {
            Probe::Missing => return Err(Error::NotFound(format!("request {request_id}"))),
            Probe::Busy => return Ok(Claim::Busy),
            Probe::Idle { status } => parse_column::<RequestStatus>("status", &status)?,
        };
        if !statuses.contains(&status) {
            return Ok(Claim::Ineligible);
        }
        let row: RequestRow = sqlx::query_as(&format!(
            "UPDATE requests SET locking = 'locking', updated_at = now()
             WHERE request_id = $1
             RETURNING {}",
            columns()
        ))
        .bind(request_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Claim::Claimed(row.try_into_request()?))
    }

    pub async fn update_request(&self, update: &RequestUpdate) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row: Option<RequestRow> = sqlx::query_as(&format!(
            "SELECT {} FROM requests WHERE request_id = $1 FOR UPDATE",
            columns()
        ))
        .bind(update.request_id)
        .fetch_optional(&mut *tx)
        .await?;
        let mut request = row
            .ok_or_else(|| Error::NotFound(format!("request {}", update.request_id)))?
            .try_into_request()?;
        request.apply(update, Utc::now());

        sqlx::query(
            "UPDATE requests SET
                status = $2, locking = $3, errors = $4,
                new_retries = $5, update_retries = $6, max_new_retries = $7, max_update_retries = $8,
                new_poll_period = $9, update_poll_period = $10,
                updated_at = $11, next_poll_at = $12
             WHERE request_id = $1",
        )
        .bind(request.request_id)
        .bind(request.status.to_string())
        .bind(request.locking.to_string())
        .bind(&request.errors)
        .bind(request.poll.new_retries)
        .bind(request.poll.update_retries)
        .bind(request.poll.max_new_retries)
        .bind(request.poll.max_update_retries)
        .bind(request.poll.new_poll_period_secs)
        .bind(request.poll.update_poll_period_secs)
        .bind(request.updated_at)
        .bind(request.next_poll_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Release request, transform and processing rows left in `locking`
    /// since before `older_than`.
    pub async fn clean_locks(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut released = 0;
        for table in ["requests", "transforms", "processings"] {
            released += sqlx::query(&format!(
                "UPDATE {table} SET locking = 'idle'
                 WHERE locking = 'locking' AND updated_at < $1"
            ))
            .bind(older_than)
            .execute(&self.pool)
            .await?
            .rows_affected();
        }
        Ok(released)
    }
}
