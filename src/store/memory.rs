//! In-process store. One async mutex guards every table, which makes each
//! trait call atomic the way a single SQL transaction is.

use super::{Claim, PollQuery, Store};
use crate::error::{Error, Result};
use crate::model::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

type HeartbeatKey = (String, String, u32, String);

#[derive(Default)]
struct Tables {
    requests: BTreeMap<i64, Request>,
    transforms: BTreeMap<i64, Transform>,
    processings: BTreeMap<i64, Processing>,
    commands: BTreeMap<i64, Command>,
    throttlers: HashMap<String, Throttler>,
    heartbeats: HashMap<HeartbeatKey, Heartbeat>,
    last_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a row due for polling now, regardless of its schedule.
    pub async fn make_due(&self, request_id: i64) {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        if let Some(r) = tables.requests.get_mut(&request_id) {
            r.next_poll_at = now;
        }
        for t in tables.transforms.values_mut().filter(|t| t.request_id == request_id) {
            t.next_poll_at = now;
        }
        for p in tables.processings.values_mut().filter(|p| p.request_id == request_id) {
            p.next_poll_at = now;
        }
    }

    pub async fn heartbeats(&self) -> Vec<Heartbeat> {
        self.tables.lock().await.heartbeats.values().cloned().collect()
    }
}

/// What the generic claim and poll helpers need from a row.
trait Row: Clone {
    type Status: Copy + PartialEq;
    const KIND: &'static str;

    fn status(&self) -> Self::Status;
    fn locking(&self) -> Locking;
    fn set_locking(&mut self, locking: Locking);
    fn request_id(&self) -> i64;
    fn priority(&self) -> i32 {
        0
    }
    fn updated_at(&self) -> DateTime<Utc>;
    fn next_poll_at(&self) -> DateTime<Utc>;
    fn touch(&mut self, now: DateTime<Utc>);
}

macro_rules! impl_row {
    ($ty:ty, $status:ty, $kind:literal, $req:ident) => {
        impl Row for $ty {
            type Status = $status;
            const KIND: &'static str = $kind;

            fn status(&self) -> $status {
                self.status
            }
            fn locking(&self) -> Locking {
                self.locking
            }
            fn set_locking(&mut self, locking: Locking) {
                self.locking = locking;
            }
            fn request_id(&self) -> i64 {
                self.$req
            }
            fn updated_at(&self) -> DateTime<Utc> {
                self.updated_at
            }
            fn next_poll_at(&self) -> DateTime<Utc> {
                self.next_poll_at
            }
            fn touch(&mut self, now: DateTime<Utc>) {
                self.updated_at = now;
            }
        }
    };
}

impl_row!(Transform, TransformStatus, "transform", request_id);
impl_row!(Processing, ProcessingStatus, "processing", request_id);

impl Row for Request {
    type Status = RequestStatus;
    const KIND: &'static str = "request";

    fn status(&self) -> RequestStatus {
        self.status
    }
    fn locking(&self) -> Locking {
        self.locking
    }
    fn set_locking(&mut self, locking: Locking) {
        self.locking = locking;
    }
    fn request_id(&self) -> i64 {
        self.request_id
    }
    fn priority(&self) -> i32 {
        self.priority
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn next_poll_at(&self) -> DateTime<Utc> {
        self.next_poll_at
    }
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

fn claim_row<R: Row>(rows: &mut BTreeMap<i64, R>, id: i64, statuses: &[R::Status]) -> Result<Claim<R>> {
    let row = rows
        .get_mut(&id)
        .ok_or_else(|| Error::NotFound(format!("{} {id}", R::KIND)))?;
    if row.locking() == Locking::Locking {
        return Ok(Claim::Busy);
    }
    if !statuses.contains(&row.status()) {
        return Ok(Claim::Ineligible);
    }
    row.set_locking(Locking::Locking);
    row.touch(Utc::now());
    Ok(Claim::Claimed(row.clone()))
}

fn due_rows<R: Row>(rows: &BTreeMap<i64, R>, query: &PollQuery<R::Status>) -> Vec<i64> {
    let now = Utc::now();
    let mut due: Vec<(i64, &R)> = rows
        .iter()
        .filter(|(_, row)| {
            row.locking() == Locking::Idle
                && query.statuses.contains(&row.status())
                && row.next_poll_at() <= now
                && query.min_request_id.is_none_or(|min| row.request_id() >= min)
        })
        .map(|(id, row)| (*id, row))
        .collect();
    due.sort_by(|(_, a), (_, b)| {
        b.priority()
            .cmp(&a.priority())
            .then(a.updated_at().cmp(&b.updated_at()))
    });
    due.into_iter()
        .take(query.limit.max(0) as usize)
        .map(|(id, _)| id)
        .collect()
}

fn release_stale<R: Row>(rows: &mut BTreeMap<i64, R>, older_than: DateTime<Utc>) -> u64 {
    let mut released = 0;
    for row in rows.values_mut() {
        if row.locking() == Locking::Locking && row.updated_at() < older_than {
            row.set_locking(Locking::Idle);
            released += 1;
        }
    }
    released
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_request(&self, new: NewRequest) -> Result<Request> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        let request = Request {
            request_id: tables.next_id(),
            name: new.name,
            requester: new.requester,
            request_type: new.request_type,
            site: new.site,
            priority: new.priority,
            status: RequestStatus::New,
            locking: Locking::Idle,
            request_metadata: new.request_metadata,
            errors: None,
            poll: new.poll,
            created_at: now,
            updated_at: now,
            next_poll_at: now,
            expired_at: new.expired_at,
        };
        tables.requests.insert(request.request_id, request.clone());
        Ok(request)
    }

    async fn get_request(&self, request_id: i64) -> Result<Request> {
        self.tables
            .lock()
            .await
            .requests
            .get(&request_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("request {request_id}")))
    }

    async fn list_requests(&self, status: Option<RequestStatus>, limit: i64) -> Result<Vec<Request>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .requests
            .values()
            .rev()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn requests_for_poll(&self, query: &PollQuery<RequestStatus>) -> Result<Vec<i64>> {
        Ok(due_rows(&self.tables.lock().await.requests, query))
    }

    async fn lock_request(&self, request_id: i64, statuses: &[RequestStatus]) -> Result<Claim<Request>> {
        claim_row(&mut self.tables.lock().await.requests, request_id, statuses)
    }

    async fn update_request(&self, update: &RequestUpdate) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .requests
            .get_mut(&update.request_id)
            .ok_or_else(|| Error::NotFound(format!("request {}", update.request_id)))?;
        row.apply(update, Utc::now());
        Ok(())
    }

    async fn insert_transform(&self, new: NewTransform) -> Result<Transform> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        if !tables.requests.contains_key(&new.request_id) {
            return Err(Error::NotFound(format!("request {}", new.request_id)));
        }
        let transform = Transform {
            transform_id: tables.next_id(),
            request_id: new.request_id,
            name: new.name,
            status: TransformStatus::New,
            locking: Locking::Idle,
            transform_metadata: new.transform_metadata,
            current_processing_id: None,
            errors: None,
            poll: new.poll,
            created_at: now,
            updated_at: now,
            next_poll_at: now,
        };
        tables.transforms.insert(transform.transform_id, transform.clone());
        Ok(transform)
    }

    async fn get_transform(&self, transform_id: i64) -> Result<Transform> {
        self.tables
            .lock()
            .await
            .transforms
            .get(&transform_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("transform {transform_id}")))
    }

    async fn transforms_of_request(&self, request_id: i64) -> Result<Vec<Transform>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .transforms
            .values()
            .filter(|t| t.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn transforms_for_poll(&self, query: &PollQuery<TransformStatus>) -> Result<Vec<i64>> {
        Ok(due_rows(&self.tables.lock().await.transforms, query))
    }

    async fn lock_transform(&self, transform_id: i64, statuses: &[TransformStatus]) -> Result<Claim<Transform>> {
        claim_row(&mut self.tables.lock().await.transforms, transform_id, statuses)
    }

    async fn update_transform(&self, update: &TransformUpdate) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .transforms
            .get_mut(&update.transform_id)
            .ok_or_else(|| Error::NotFound(format!("transform {}", update.transform_id)))?;
        row.apply(update, Utc::now());
        Ok(())
    }

    async fn insert_processing(&self, new: NewProcessing) -> Result<Processing> {
        let now = Utc::now();
        let mut tables = self.tables.lock().await;
        if !tables.transforms.contains_key(&new.transform_id) {
            return Err(Error::NotFound(format!("transform {}", new.transform_id)));
        }
        let processing = Processing {
            processing_id: tables.next_id(),
            transform_id: new.transform_id,
            request_id: new.request_id,
            status: ProcessingStatus::New,
            locking: Locking::Idle,
            workload_id: None,
            processing_metadata: new.processing_metadata,
            polling_retries: 0,
            errors: None,
            poll: new.poll,
            submitted_at: None,
            created_at: now,
            updated_at: now,
            next_poll_at: now,
        };
        tables
            .processings
            .insert(processing.processing_id, processing.clone());
        Ok(processing)
    }

    async fn get_processing(&self, processing_id: i64) -> Result<Processing> {
        self.tables
            .lock()
            .await
            .processings
            .get(&processing_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("processing {processing_id}")))
    }

    async fn processings_for_poll(&self, query: &PollQuery<ProcessingStatus>) -> Result<Vec<i64>> {
        Ok(due_rows(&self.tables.lock().await.processings, query))
    }

    async fn lock_processing(
        &self,
        processing_id: i64,
        statuses: &[ProcessingStatus],
    ) -> Result<Claim<Processing>> {
        claim_row(&mut self.tables.lock().await.processings, processing_id, statuses)
    }

    async fn update_processing(&self, update: &ProcessingUpdate) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .processings
            .get_mut(&update.processing_id)
            .ok_or_else(|| Error::NotFound(format!("processing {}", update.processing_id)))?;
        row.apply(update, Utc::now());
        Ok(())
    }

    async fn insert_command(&self, new: NewCommand) -> Result<Command> {
        let mut tables = self.tables.lock().await;
        if !tables.requests.contains_key(&new.request_id) {
            return Err(Error::NotFound(format!("request {}", new.request_id)));
        }
        let command = Command {
            command_id: tables.next_id(),
            request_id: new.request_id,
            transform_id: new.transform_id,
            cmd_type: new.cmd_type,
            status: CommandStatus::New,
            locking: Locking::Idle,
            cmd_content: new.cmd_content,
            created_at: Utc::now(),
        };
        tables.commands.insert(command.command_id, command.clone());
        Ok(command)
    }

    async fn claim_new_commands(&self, limit: i64) -> Result<Vec<Command>> {
        let mut tables = self.tables.lock().await;
        let mut claimed = Vec::new();
        for command in tables.commands.values_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if command.status == CommandStatus::New && command.locking == Locking::Idle {
                command.status = CommandStatus::Processing;
                claimed.push(command.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_command(&self, command_id: i64, status: CommandStatus) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let command = tables
            .commands
            .get_mut(&command_id)
            .ok_or_else(|| Error::NotFound(format!("command {command_id}")))?;
        command.status = status;
        command.locking = Locking::Idle;
        Ok(())
    }

    async fn throttler(&self, site: &str) -> Result<Option<Throttler>> {
        Ok(self.tables.lock().await.throttlers.get(site).cloned())
    }

    async fn upsert_throttler(&self, throttler: &Throttler) -> Result<()> {
        self.tables
            .lock()
            .await
            .throttlers
            .insert(throttler.site.clone(), throttler.clone());
        Ok(())
    }

    async fn active_counts(&self, site: &str) -> Result<ActiveCounts> {
        let tables = self.tables.lock().await;
        let on_site = |request_id: i64| {
            tables
                .requests
                .get(&request_id)
                .is_some_and(|r| r.site.as_deref() == Some(site))
        };
        Ok(ActiveCounts {
            requests: tables
                .requests
                .values()
                .filter(|r| r.site.as_deref() == Some(site) && RequestStatus::ACTIVE.contains(&r.status))
                .count() as i64,
            transforms: tables
                .transforms
                .values()
                .filter(|t| TransformStatus::ACTIVE.contains(&t.status) && on_site(t.request_id))
                .count() as i64,
            processings: tables
                .processings
                .values()
                .filter(|p| ProcessingStatus::ACTIVE.contains(&p.status) && on_site(p.request_id))
                .count() as i64,
        })
    }

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        let key = (
            heartbeat.agent.clone(),
            heartbeat.hostname.clone(),
            heartbeat.pid,
            heartbeat.thread_id.clone(),
        );
        self.tables
            .lock()
            .await
            .heartbeats
            .insert(key, heartbeat.clone());
        Ok(())
    }

    async fn clean_heartbeats(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let before = tables.heartbeats.len();
        tables.heartbeats.retain(|_, hb| hb.updated_at >= older_than);
        Ok((before - tables.heartbeats.len()) as u64)
    }

    async fn clean_locks(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        Ok(release_stale(&mut tables.requests, older_than)
            + release_stale(&mut tables.transforms, older_than)
            + release_stale(&mut tables.processings, older_than))
    }
}
