//! Operator commands and per-site throttlers.

use super::parse_column;
use crate::error::{Error, Result};
use crate::model::*;
use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(sqlx::FromRow)]
struct CommandRow {
    command_id: i64,
    request_id: i64,
    transform_id: Option<i64>,
    cmd_type: String,
    status: String,
    locking: String,
    cmd_content: Option<Value>,
    created_at: DateTime<Utc>,
}

impl CommandRow {
    fn try_into_command(self) -> Result<Command> {
        Ok(Command {
            command_id: self.command_id,
            request_id: self.request_id,
            transform_id: self.transform_id,
            cmd_type: self.cmd_type,
            status: parse_column("status", &self.status)?,
            locking: parse_column("locking", &self.locking)?,
            cmd_content: self.cmd_content,
            created_at: self.created_at,
        })
    }
}

const COMMAND_COLUMNS: &str =
    "command_id, request_id, transform_id, cmd_type, status, locking, cmd_content, created_at";

impl super::Db {
    pub async fn insert_command(&self, new: NewCommand) -> Result<Command> {
        let row: CommandRow = sqlx::query_as(&format!(
            "INSERT INTO commands (request_id, transform_id, cmd_type, cmd_content)
             VALUES ($1, $2, $3, $4)
             RETURNING {COMMAND_COLUMNS}"
        ))
        .bind(new.request_id)
        .bind(new.transform_id)
        .bind(&new.cmd_type)
        .bind(&new.cmd_content)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                Error::NotFound(format!("request {}", new.request_id))
            }
            other => Error::Database(other),
        })?;
        row.try_into_command()
    }

    /// Move up to `limit` new commands to `processing`, oldest first.
    /// Concurrent callers never receive the same command.
    pub async fn claim_new_commands(&self, limit: i64) -> Result<Vec<Command>> {
        let rows: Vec<CommandRow> = sqlx::query_as(
            "WITH claimable AS (
                SELECT command_id FROM commands
                WHERE status = 'new' AND locking = 'idle'
                ORDER BY command_id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
             )
             UPDATE commands c SET status = 'processing', updated_at = now()
             FROM claimable
             WHERE c.command_id = claimable.command_id
             RETURNING c.command_id, c.request_id, c.transform_id, c.cmd_type, c.status,
                       c.locking, c.cmd_content, c.created_at",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        let mut commands = rows
            .into_iter()
            .map(CommandRow::try_into_command)
            .collect::<Result<Vec<_>>>()?;
        commands.sort_by_key(|c| c.command_id);
        Ok(commands)
    }

    pub async fn update_command(&self, command_id: i64, status: CommandStatus) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE commands SET status = $2, locking = 'idle', updated_at = now()
             WHERE command_id = $1",
        )
        .bind(command_id)
        .bind(status.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(Error::NotFound(format!("command {command_id}")));
        }
        Ok(())
    }

    pub async fn throttler(&self, site: &str) -> Result<Option<Throttler>> {
        let row: Option<(String, Option<i64>, Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT site, num_requests, num_transforms, num_processings
             FROM throttlers WHERE site = $1",
        )
        .bind(site)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(site, num_requests, num_transforms, num_processings)| Throttler {
            site,
            num_requests,
            num_transforms,
            num_processings,
        }))
    }

    pub async fn upsert_throttler(&self, throttler: &Throttler) -> Result<()> {
        sqlx::query(
            "INSERT INTO throttlers (site, num_requests, num_transforms, num_processings)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (site) DO UPDATE SET
                num_requests = EXCLUDED.num_requests,
                num_transforms = EXCLUDED.num_transforms,
                num_processings = EXCLUDED.num_processings,
                updated_at = now()",
        )
        .bind(&throttler.site)
        .bind(throttler.num_requests)
        .bind(throttler.num_transforms)
        .bind(throttler.num_processings)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Active requests, transforms and processings whose request targets
    /// `site`.
    pub async fn active_counts(&self, site: &str) -> Result<ActiveCounts> {
        let (requests, transforms, processings): (i64, i64, i64) = sqlx::query_as(
            "SELECT
                (SELECT count(*) FROM requests
                 WHERE site = $1 AND status = ANY($2)),
                (SELECT count(*) FROM transforms t JOIN requests r USING (request_id)
                 WHERE r.site = $1 AND t.status = ANY($3)),
                (SELECT count(*) FROM processings p JOIN requests r USING (request_id)
                 WHERE r.site = $1 AND p.status = ANY($4))",
        )
        .bind(site)
        .bind(super::status_names(RequestStatus::ACTIVE))
        .bind(super::status_names(TransformStatus::ACTIVE))
        .bind(super::status_names(ProcessingStatus::ACTIVE))
        .fetch_one(&self.pool)
        .await?;
        Ok(ActiveCounts {
            requests,
            transforms,
            processings,
        })
    }
}
