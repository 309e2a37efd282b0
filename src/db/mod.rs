//! Postgres access: connection pool, migrations, health check, and the
//! per-table query modules.

pub mod commands;
pub mod events;
pub mod health;
pub mod processings;
pub mod requests;
pub mod store;
pub mod transforms;

use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool shared by every agent.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, 10).await
    }

    pub async fn connect_with(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Map a status column that failed to parse into a decode error.
pub(crate) fn parse_column<T: std::str::FromStr>(column: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        crate::error::Error::Other(format!("unexpected {column} value in database: {value}"))
    })
}

/// Status slices as text for `= ANY($n)` binds.
pub(crate) fn status_names<S: std::fmt::Display>(statuses: &[S]) -> Vec<String> {
    statuses.iter().map(ToString::to_string).collect()
}

/// What a `FOR UPDATE SKIP LOCKED` probe found for one row.
pub(crate) enum Probe {
    Missing,
    /// Row lock held by another transaction, or the row is flagged
    /// `locking`.
    Busy,
    Idle { status: String },
}

/// Probe a polled row inside the caller's transaction. An `Idle` result
/// leaves the row locked until the transaction ends.
pub(crate) async fn probe_row(
    conn: &mut sqlx::PgConnection,
    table: &str,
    id_column: &str,
    id: i64,
) -> Result<Probe> {
    let row: Option<(String, String)> = sqlx::query_as(&format!(
        "SELECT status, locking FROM {table} WHERE {id_column} = $1 FOR UPDATE SKIP LOCKED"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some((_, locking)) if locking == "locking" => Ok(Probe::Busy),
        Some((status, _)) => Ok(Probe::Idle { status }),
        None => {
            let (exists,): (bool,) = sqlx::query_as(&format!(
                "SELECT EXISTS (SELECT 1 FROM {table} WHERE {id_column} = $1)"
            ))
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;
            Ok(if exists { Probe::Busy } else { Probe::Missing })
        }
    }
}

/// Poll counters as stored in the `*_retries` and `*_poll_period`
/// columns.
#[derive(sqlx::FromRow)]
pub(crate) struct PollColumns {
    new_retries: i32,
    update_retries: i32,
    max_new_retries: i32,
    max_update_retries: i32,
    new_poll_period: i64,
    update_poll_period: i64,
}

impl From<PollColumns> for crate::model::PollState {
    fn from(c: PollColumns) -> Self {
        Self {
            new_retries: c.new_retries,
            update_retries: c.update_retries,
            max_new_retries: c.max_new_retries,
            max_update_retries: c.max_update_retries,
            new_poll_period_secs: c.new_poll_period,
            update_poll_period_secs: c.update_poll_period,
        }
    }
}

pub(crate) const POLL_COLUMNS: &str =
    "new_retries, update_retries, max_new_retries, max_update_retries, new_poll_period, update_poll_period";
