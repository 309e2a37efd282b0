//! Entity store used by the agents.
//!
//! Two implementations: [`crate::db::Db`] against Postgres, and
//! [`MemoryStore`] in process. Both give the same claim guarantee: of any
//! number of concurrent `lock_*` calls on one row, at most one returns
//! [`Claim::Claimed`] until the row is released by its update.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::{Error, Result};
use crate::model::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Outcome of trying to claim a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim<T> {
    /// The row is ours until the matching update is applied.
    Claimed(T),
    /// Another worker holds the row.
    Busy,
    /// The row is no longer in a status this claim is for.
    Ineligible,
}

impl<T> Claim<T> {
    /// Turn `Busy` into [`Error::Locked`] so the dispatcher requeues the
    /// event; `Ineligible` becomes `None`.
    pub fn into_claimed(self, what: impl FnOnce() -> String) -> Result<Option<T>> {
        match self {
            Claim::Claimed(row) => Ok(Some(row)),
            Claim::Busy => Err(Error::Locked(what())),
            Claim::Ineligible => Ok(None),
        }
    }
}

/// Which rows a poller wants.
#[derive(Debug, Clone)]
pub struct PollQuery<S> {
    pub statuses: Vec<S>,
    pub limit: i64,
    /// Skip requests below this id.
    pub min_request_id: Option<i64>,
}

impl<S: Copy> PollQuery<S> {
    pub fn new(statuses: &[S], limit: i64) -> Self {
        Self {
            statuses: statuses.to_vec(),
            limit,
            min_request_id: None,
        }
    }

    pub fn min_request_id(mut self, min: Option<i64>) -> Self {
        self.min_request_id = min;
        self
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // --- requests ---
    async fn insert_request(&self, new: NewRequest) -> Result<Request>;
    async fn get_request(&self, request_id: i64) -> Result<Request>;
    async fn list_requests(&self, status: Option<RequestStatus>, limit: i64) -> Result<Vec<Request>>;
    /// Ids of idle rows in the given statuses that are due for polling,
    /// highest priority first, then least recently updated.
    async fn requests_for_poll(&self, query: &PollQuery<RequestStatus>) -> Result<Vec<i64>>;
    async fn lock_request(&self, request_id: i64, statuses: &[RequestStatus]) -> Result<Claim<Request>>;
    /// Apply a handler's outcome, schedule the next poll and release the
    /// lock.
    async fn update_request(&self, update: &RequestUpdate) -> Result<()>;

    // --- transforms ---
    async fn insert_transform(&self, new: NewTransform) -> Result<Transform>;
    async fn get_transform(&self, transform_id: i64) -> Result<Transform>;
    async fn transforms_of_request(&self, request_id: i64) -> Result<Vec<Transform>>;
    async fn transforms_for_poll(&self, query: &PollQuery<TransformStatus>) -> Result<Vec<i64>>;
    async fn lock_transform(&self, transform_id: i64, statuses: &[TransformStatus]) -> Result<Claim<Transform>>;
    async fn update_transform(&self, update: &TransformUpdate) -> Result<()>;

    // --- processings ---
    async fn insert_processing(&self, new: NewProcessing) -> Result<Processing>;
    async fn get_processing(&self, processing_id: i64) -> Result<Processing>;
    async fn processings_for_poll(&self, query: &PollQuery<ProcessingStatus>) -> Result<Vec<i64>>;
    async fn lock_processing(
        &self,
        processing_id: i64,
        statuses: &[ProcessingStatus],
    ) -> Result<Claim<Processing>>;
    async fn update_processing(&self, update: &ProcessingUpdate) -> Result<()>;

    // --- commands ---
    async fn insert_command(&self, new: NewCommand) -> Result<Command>;
    /// Claim up to `limit` new commands, oldest first.
    async fn claim_new_commands(&self, limit: i64) -> Result<Vec<Command>>;
    async fn update_command(&self, command_id: i64, status: CommandStatus) -> Result<()>;

    // --- throttling ---
    async fn throttler(&self, site: &str) -> Result<Option<Throttler>>;
    async fn upsert_throttler(&self, throttler: &Throttler) -> Result<()>;
    async fn active_counts(&self, site: &str) -> Result<ActiveCounts>;

    // --- housekeeping ---
    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()>;
    async fn clean_heartbeats(&self, older_than: DateTime<Utc>) -> Result<u64>;
    /// Release rows left in `locking` since before `older_than`.
    async fn clean_locks(&self, older_than: DateTime<Utc>) -> Result<u64>;
}
