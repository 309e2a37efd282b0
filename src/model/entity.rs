//! Persistent entities: requests, transforms, processings and commands.

use super::status::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fold newly reported errors into the stored ones, key by key, so a
/// later `update_err` keeps the `submit_err` written before it. A stored
/// value that is not an object is replaced.
fn merge_errors(stored: &mut Option<Value>, new: &Value) {
    match (stored.as_mut(), new) {
        (Some(Value::Object(current)), Value::Object(entries)) => {
            for (key, value) in entries {
                current.insert(key.clone(), value.clone());
            }
        }
        _ => *stored = Some(new.clone()),
    }
}

// ---------------------------------------------------------------------------
// Poll state
// ---------------------------------------------------------------------------

/// Retry counters and poll periods shared by every polled entity.
///
/// After each update a row becomes due again after the new-phase or the
/// update-phase period, depending on the status it was left in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollState {
    pub new_retries: i32,
    pub update_retries: i32,
    /// 0 means unlimited.
    pub max_new_retries: i32,
    /// 0 means unlimited.
    pub max_update_retries: i32,
    pub new_poll_period_secs: i64,
    pub update_poll_period_secs: i64,
}

impl PollState {
    pub fn new(max_new_retries: i32, max_update_retries: i32, poll_period_secs: i64) -> Self {
        Self {
            new_retries: 0,
            update_retries: 0,
            max_new_retries,
            max_update_retries,
            new_poll_period_secs: poll_period_secs,
            update_poll_period_secs: poll_period_secs,
        }
    }

    pub fn period_secs(&self, phase: PollPhase) -> i64 {
        match phase {
            PollPhase::New => self.new_poll_period_secs,
            PollPhase::Update => self.update_poll_period_secs,
        }
    }

    pub fn next_poll_at(&self, now: DateTime<Utc>, phase: PollPhase) -> DateTime<Utc> {
        now + chrono::Duration::seconds(self.period_secs(phase))
    }
}

impl Default for PollState {
    fn default() -> Self {
        Self::new(3, 0, 10)
    }
}

/// Which poller a status belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    New,
    Update,
}

impl RequestStatus {
    pub fn poll_phase(self) -> PollPhase {
        if RequestStatus::NEW.contains(&self) {
            PollPhase::New
        } else {
            PollPhase::Update
        }
    }
}

impl TransformStatus {
    pub fn poll_phase(self) -> PollPhase {
        if TransformStatus::NEW.contains(&self) {
            PollPhase::New
        } else {
            PollPhase::Update
        }
    }
}

impl ProcessingStatus {
    pub fn poll_phase(self) -> PollPhase {
        if ProcessingStatus::NEW.contains(&self) {
            PollPhase::New
        } else {
            PollPhase::Update
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: i64,
    pub name: String,
    pub requester: String,
    pub request_type: String,
    pub site: Option<String>,
    pub priority: i32,
    pub status: RequestStatus,
    pub locking: Locking,
    /// Carries the workflow definition: `{"works": [{"name": ..}, ..]}`.
    pub request_metadata: Value,
    pub errors: Option<Value>,
    pub poll: PollState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_poll_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl Request {
    /// One entry per transform the request should create. A request
    /// without an explicit `works` list is a single unit of work.
    pub fn works(&self) -> Vec<Value> {
        match self.request_metadata.get("works").and_then(Value::as_array) {
            Some(works) if !works.is_empty() => works.clone(),
            _ => vec![serde_json::json!({ "name": self.name })],
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expired_at.is_some_and(|at| at < now)
    }

    /// Apply a handler's outcome, release the lock and schedule the next
    /// poll.
    pub fn apply(&mut self, update: &RequestUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(errors) = &update.errors {
            merge_errors(&mut self.errors, errors);
        }
        if let Some(poll) = update.poll {
            self.poll = poll;
        }
        self.locking = Locking::Idle;
        self.updated_at = now;
        self.next_poll_at = self.poll.next_poll_at(now, self.status.poll_phase());
    }
}

/// Builder for new requests.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub(crate) name: String,
    pub(crate) requester: String,
    pub(crate) request_type: String,
    pub(crate) site: Option<String>,
    pub(crate) priority: i32,
    pub(crate) request_metadata: Value,
    pub(crate) poll: PollState,
    pub(crate) expired_at: Option<DateTime<Utc>>,
}

impl NewRequest {
    pub fn new(name: impl Into<String>, requester: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requester: requester.into(),
            request_type: "workflow".to_string(),
            site: None,
            priority: 0,
            request_metadata: serde_json::json!({}),
            poll: PollState::default(),
            expired_at: None,
        }
    }

    pub fn request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = request_type.into();
        self
    }

    pub fn site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.request_metadata = metadata;
        self
    }

    /// Shorthand for `metadata({"works": works})`.
    pub fn works(mut self, works: Vec<Value>) -> Self {
        self.request_metadata = serde_json::json!({ "works": works });
        self
    }

    pub fn poll(mut self, poll: PollState) -> Self {
        self.poll = poll;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expired_at = Some(at);
        self
    }
}

/// The outcome of handling a request. Applying it always releases the
/// row's lock, whatever else it changes.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestUpdate {
    pub request_id: i64,
    pub status: Option<RequestStatus>,
    pub errors: Option<Value>,
    pub poll: Option<PollState>,
}

impl RequestUpdate {
    pub fn new(request_id: i64) -> Self {
        Self {
            request_id,
            status: None,
            errors: None,
            poll: None,
        }
    }

    pub fn status(mut self, status: RequestStatus) -> Self {
        self.status = Some(status);
        self
    }
}

// ---------------------------------------------------------------------------
// Transform
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transform {
    pub transform_id: i64,
    pub request_id: i64,
    pub name: String,
    pub status: TransformStatus,
    pub locking: Locking,
    pub transform_metadata: Value,
    pub current_processing_id: Option<i64>,
    pub errors: Option<Value>,
    pub poll: PollState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_poll_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTransform {
    pub request_id: i64,
    pub name: String,
    pub transform_metadata: Value,
    pub poll: PollState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformUpdate {
    pub transform_id: i64,
    pub status: Option<TransformStatus>,
    pub current_processing_id: Option<i64>,
    pub errors: Option<Value>,
    pub poll: Option<PollState>,
}

impl TransformUpdate {
    pub fn new(transform_id: i64) -> Self {
        Self {
            transform_id,
            status: None,
            current_processing_id: None,
            errors: None,
            poll: None,
        }
    }

    pub fn status(mut self, status: TransformStatus) -> Self {
        self.status = Some(status);
        self
    }
}

impl Transform {
    pub fn apply(&mut self, update: &TransformUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(id) = update.current_processing_id {
            self.current_processing_id = Some(id);
        }
        if let Some(errors) = &update.errors {
            merge_errors(&mut self.errors, errors);
        }
        if let Some(poll) = update.poll {
            self.poll = poll;
        }
        self.locking = Locking::Idle;
        self.updated_at = now;
        self.next_poll_at = self.poll.next_poll_at(now, self.status.poll_phase());
    }
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Processing {
    pub processing_id: i64,
    pub transform_id: i64,
    pub request_id: i64,
    pub status: ProcessingStatus,
    pub locking: Locking,
    /// Id assigned by the external workload system once submitted.
    pub workload_id: Option<String>,
    pub processing_metadata: Value,
    /// Consecutive terminal observations not yet reported.
    pub polling_retries: i32,
    pub errors: Option<Value>,
    pub poll: PollState,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_poll_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProcessing {
    pub transform_id: i64,
    pub request_id: i64,
    pub processing_metadata: Value,
    pub poll: PollState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingUpdate {
    pub processing_id: i64,
    pub status: Option<ProcessingStatus>,
    pub workload_id: Option<String>,
    pub polling_retries: Option<i32>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub errors: Option<Value>,
    pub poll: Option<PollState>,
}

impl ProcessingUpdate {
    pub fn new(processing_id: i64) -> Self {
        Self {
            processing_id,
            status: None,
            workload_id: None,
            polling_retries: None,
            submitted_at: None,
            errors: None,
            poll: None,
        }
    }

    pub fn status(mut self, status: ProcessingStatus) -> Self {
        self.status = Some(status);
        self
    }
}

impl Processing {
    pub fn apply(&mut self, update: &ProcessingUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(workload_id) = &update.workload_id {
            self.workload_id = Some(workload_id.clone());
        }
        if let Some(retries) = update.polling_retries {
            self.polling_retries = retries;
        }
        if let Some(at) = update.submitted_at {
            self.submitted_at = Some(at);
        }
        if let Some(errors) = &update.errors {
            merge_errors(&mut self.errors, errors);
        }
        if let Some(poll) = update.poll {
            self.poll = poll;
        }
        self.locking = Locking::Idle;
        self.updated_at = now;
        self.next_poll_at = self.poll.next_poll_at(now, self.status.poll_phase());
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// An operator instruction against a request (abort, resume, expire).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub command_id: i64,
    pub request_id: i64,
    pub transform_id: Option<i64>,
    /// Raw command type. Kept as text so unknown commands can be reported
    /// back instead of failing to load.
    pub cmd_type: String,
    pub status: CommandStatus,
    pub locking: Locking,
    pub cmd_content: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Command {
    pub fn command_type(&self) -> Option<CommandType> {
        self.cmd_type.parse().ok()
    }
}

#[derive(Debug, Clone)]
pub struct NewCommand {
    pub request_id: i64,
    pub transform_id: Option<i64>,
    pub cmd_type: String,
    pub cmd_content: Option<Value>,
}

impl NewCommand {
    pub fn new(request_id: i64, cmd_type: CommandType) -> Self {
        Self {
            request_id,
            transform_id: None,
            cmd_type: cmd_type.to_string(),
            cmd_content: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Throttling
// ---------------------------------------------------------------------------

/// Per-site ceilings on concurrently active work. `None` means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throttler {
    pub site: String,
    pub num_requests: Option<i64>,
    pub num_transforms: Option<i64>,
    pub num_processings: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveCounts {
    pub requests: i64,
    pub transforms: i64,
    pub processings: i64,
}

impl Throttler {
    /// Whether another request may start on this site.
    pub fn is_exceeded_by(&self, active: &ActiveCounts) -> bool {
        let over = |limit: Option<i64>, current: i64| limit.is_some_and(|l| current >= l);
        over(self.num_requests, active.requests)
            || over(self.num_transforms, active.transforms)
            || over(self.num_processings, active.processings)
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Liveness row written periodically by each agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent: String,
    pub hostname: String,
    pub pid: u32,
    pub thread_id: String,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn throttler_limits() {
        let throttler = Throttler {
            site: "CERN".into(),
            num_requests: Some(2),
            num_transforms: None,
            num_processings: Some(10),
        };
        let mut active = ActiveCounts {
            requests: 1,
            transforms: 500,
            processings: 9,
        };
        assert!(!throttler.is_exceeded_by(&active));
        active.requests = 2;
        assert!(throttler.is_exceeded_by(&active));
    }

    #[test]
    fn request_without_works_is_one_unit() {
        let now = Utc::now();
        let request = Request {
            request_id: 1,
            name: "reco".into(),
            requester: "alice".into(),
            request_type: "workflow".into(),
            site: None,
            priority: 0,
            status: RequestStatus::New,
            locking: Locking::Idle,
            request_metadata: json!({}),
            errors: None,
            poll: PollState::default(),
            created_at: now,
            updated_at: now,
            next_poll_at: now,
            expired_at: None,
        };
        assert_eq!(request.works(), vec![json!({"name": "reco"})]);
        assert!(!request.is_expired(now));
    }

    #[test]
    fn later_errors_keep_earlier_keys() {
        let now = Utc::now();
        let mut processing = Processing {
            processing_id: 3,
            transform_id: 2,
            request_id: 1,
            status: ProcessingStatus::New,
            locking: Locking::Locking,
            workload_id: None,
            processing_metadata: json!({}),
            polling_retries: 0,
            errors: None,
            poll: PollState::default(),
            submitted_at: None,
            created_at: now,
            updated_at: now,
            next_poll_at: now,
        };
        for errors in [
            json!({"submit_err": {"msg": "no quota"}}),
            json!({"update_err": {"msg": "timed out"}}),
            json!({"update_err": {"msg": "refused"}}),
        ] {
            let update = ProcessingUpdate {
                errors: Some(errors),
                ..ProcessingUpdate::new(3)
            };
            processing.apply(&update, now);
        }
        assert_eq!(
            processing.errors,
            Some(json!({
                "submit_err": {"msg": "no quota"},
                "update_err": {"msg": "refused"}
            }))
        );
    }
}
