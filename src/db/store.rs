//! [`Store`] over Postgres. Every method is the inherent query of the same
//! name; row claims use `FOR UPDATE SKIP LOCKED`.

use super::Db;
use crate::error::Result;
use crate::model::*;
use crate::store::{Claim, PollQuery, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
impl Store for Db {
    async fn insert_request(&self, new: NewRequest) -> Result<Request> {
        Db::insert_request(self, new).await
    }

    async fn get_request(&self, request_id: i64) -> Result<Request> {
        Db::get_request(self, request_id).await
    }

    async fn list_requests(&self, status: Option<RequestStatus>, limit: i64) -> Result<Vec<Request>> {
        Db::list_requests(self, status, limit).await
    }

    async fn requests_for_poll(&self, query: &PollQuery<RequestStatus>) -> Result<Vec<i64>> {
        Db::requests_for_poll(self, query).await
    }

    async fn lock_request(&self, request_id: i64, statuses: &[RequestStatus]) -> Result<Claim<Request>> {
        Db::lock_request(self, request_id, statuses).await
    }

    async fn update_request(&self, update: &RequestUpdate) -> Result<()> {
        Db::update_request(self, update).await
    }

    async fn insert_transform(&self, new: NewTransform) -> Result<Transform> {
        Db::insert_transform(self, new).await
    }

    async fn get_transform(&self, transform_id: i64) -> Result<Transform> {
        Db::get_transform(self, transform_id).await
    }

    async fn transforms_of_request(&self, request_id: i64) -> Result<Vec<Transform>> {
        Db::transforms_of_request(self, request_id).await
    }

    async fn transforms_for_poll(&self, query: &PollQuery<TransformStatus>) -> Result<Vec<i64>> {
        Db::transforms_for_poll(self, query).await
    }

    async fn lock_transform(&self, transform_id: i64, statuses: &[TransformStatus]) -> Result<Claim<Transform>> {
        Db::lock_transform(self, transform_id, statuses).await
    }

    async fn update_transform(&self, update: &TransformUpdate) -> Result<()> {
        Db::update_transform(self, update).await
    }

    async fn insert_processing(&self, new: NewProcessing) -> Result<Processing> {
        Db::insert_processing(self, new).await
    }

    async fn get_processing(&self, processing_id: i64) -> Result<Processing> {
        Db::get_processing(self, processing_id).await
    }

    async fn processings_for_poll(&self, query: &PollQuery<ProcessingStatus>) -> Result<Vec<i64>> {
        Db::processings_for_poll(self, query).await
    }

    async fn lock_processing(
        &self,
        processing_id: i64,
        statuses: &[ProcessingStatus],
    ) -> Result<Claim<Processing>> {
        Db::lock_processing(self, processing_id, statuses).await
    }

    async fn update_processing(&self, update: &ProcessingUpdate) -> Result<()> {
        Db::update_processing(self, update).await
    }

    async fn insert_command(&self, new: NewCommand) -> Result<Command> {
        Db::insert_command(self, new).await
    }

    async fn claim_new_commands(&self, limit: i64) -> Result<Vec<Command>> {
        Db::claim_new_commands(self, limit).await
    }

    async fn update_command(&self, command_id: i64, status: CommandStatus) -> Result<()> {
        Db::update_command(self, command_id, status).await
    }

    async fn throttler(&self, site: &str) -> Result<Option<Throttler>> {
        Db::throttler(self, site).await
    }

    async fn upsert_throttler(&self, throttler: &Throttler) -> Result<()> {
        Db::upsert_throttler(self, throttler).await
    }

    async fn active_counts(&self, site: &str) -> Result<ActiveCounts> {
        Db::active_counts(self, site).await
    }

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        Db::heartbeat(self, heartbeat).await
    }

    async fn clean_heartbeats(&self, older_than: DateTime<Utc>) -> Result<u64> {
        Db::clean_heartbeats(self, older_than).await
    }

    async fn clean_locks(&self, older_than: DateTime<Utc>) -> Result<u64> {
        Db::clean_locks(self, older_than).await
    }
}
