//! Clerk: turns new requests into transforms, folds transform outcomes back
//! into the request status, and applies operator commands.

use super::retry::{error_entry, retry_transient};
use super::{Agent, AgentDeps, TimerSpec, subject};
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::{Claim, PollQuery};
use crate::telemetry::dispatch::record_state_transition;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{Span, debug, info, warn};

const NEW_REQUESTS: &str = "get_new_requests";
const RUNNING_REQUESTS: &str = "get_running_requests";
const OPERATION_REQUESTS: &str = "get_operation_requests";
const CLEAN_MIN_REQUEST_ID: &str = "clean_min_request_id";
const CLEAN_LOCKS: &str = "clean_locks";

const EVENT_TYPES: &[EventType] = &[
    EventType::NewRequest,
    EventType::UpdateRequest,
    EventType::AbortRequest,
    EventType::ResumeRequest,
    EventType::ExpireRequest,
];

pub struct Clerk {
    deps: AgentDeps,
}

impl Clerk {
    pub fn new(deps: AgentDeps) -> Self {
        Self { deps }
    }

    async fn poll_requests(
        &self,
        poller: &'static str,
        statuses: &[RequestStatus],
        event_type: EventType,
    ) -> Result<()> {
        let query = PollQuery::new(statuses, self.deps.config.retrieve_bulk_size)
            .min_request_id(self.deps.context.window_floor(poller));
        let ids = self.deps.store.requests_for_poll(&query).await?;
        if ids.is_empty() {
            return Ok(());
        }
        for &id in &ids {
            self.deps.context.observe(id);
        }
        debug!(poller, count = ids.len(), "requests due");
        self.deps.publish(event_type, &ids).await
    }

    /// Turn new operator commands into request events.
    async fn poll_commands(&self) -> Result<()> {
        let commands = self
            .deps
            .store
            .claim_new_commands(self.deps.config.retrieve_bulk_size)
            .await?;
        let mut events = Vec::with_capacity(commands.len());
        for command in commands {
            let event_type = match command.command_type() {
                Some(CommandType::AbortRequest) => EventType::AbortRequest,
                Some(CommandType::ResumeRequest) => EventType::ResumeRequest,
                Some(CommandType::ExpireRequest) => EventType::ExpireRequest,
                None => {
                    warn!(
                        command_id = command.command_id,
                        cmd_type = %command.cmd_type,
                        "unknown command"
                    );
                    self.deps
                        .store
                        .update_command(command.command_id, CommandStatus::UnknownCommand)
                        .await?;
                    continue;
                }
            };
            info!(
                command_id = command.command_id,
                request_id = command.request_id,
                %event_type,
                "command received"
            );
            events.push(
                self.deps
                    .event(event_type, command.request_id)
                    .with_command(command.command_id),
            );
        }
        self.deps.send_all(events).await
    }

    async fn clean_locks(&self) -> Result<()> {
        let older_than = Utc::now() - chrono::Duration::seconds(self.deps.config.lock_lease_secs);
        let released = self.deps.store.clean_locks(older_than).await?;
        if released > 0 {
            warn!(released, "released abandoned locks");
        }
        Ok(())
    }

    async fn claim(&self, request_id: i64, statuses: &[RequestStatus]) -> Result<Option<Request>> {
        self.deps
            .store
            .lock_request(request_id, statuses)
            .await?
            .into_claimed(|| format!("request {request_id}"))
    }

    async fn save(&self, request: &Request, update: RequestUpdate) -> Result<()> {
        if let Some(to) = update.status {
            record_state_transition(&Span::current(), "request", request.status.as_str(), to.as_str());
        }
        retry_transient("update_request", || self.deps.store.update_request(&update)).await
    }

    /// Persist a handler's outcome. A failure is booked against the
    /// request's retry counters, saved, and then returned.
    async fn conclude(&self, request: &Request, error_key: &str, outcome: Result<RequestUpdate>) -> Result<()> {
        match outcome {
            Ok(update) => self.save(request, update).await,
            Err(e) => {
                let mut poll = request.poll;
                let exhausted = self
                    .deps
                    .retry_policy()
                    .on_error(&mut poll, request.status.poll_phase());
                warn!(request_id = request.request_id, exhausted, "request handler failed: {e}");
                let update = RequestUpdate {
                    request_id: request.request_id,
                    status: exhausted.then_some(RequestStatus::Failed),
                    errors: Some(error_entry(error_key, &e)),
                    poll: Some(poll),
                };
                self.save(request, update).await?;
                Err(e)
            }
        }
    }

    async fn process_new_request(&self, request_id: i64) -> Result<()> {
        let Some(request) = self.claim(request_id, RequestStatus::NEW).await? else {
            debug!(request_id, "request is no longer new");
            return Ok(());
        };
        let outcome = self.start_request(&request).await;
        self.conclude(&request, "submit_err", outcome).await
    }

    async fn start_request(&self, request: &Request) -> Result<RequestUpdate> {
        let request_id = request.request_id;
        if let Some(site) = &request.site {
            if self.is_throttled(site).await? {
                info!(request_id, site, "site is over its limits, throttling request");
                return Ok(RequestUpdate::new(request_id).status(RequestStatus::Throttling));
            }
        }

        let existing: HashSet<String> = self
            .deps
            .store
            .transforms_of_request(request_id)
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect();
        let mut created = Vec::new();
        for (i, work) in request.works().into_iter().enumerate() {
            let name = work
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}_{i}", request.name));
            if existing.contains(&name) {
                continue;
            }
            let transform = self
                .deps
                .store
                .insert_transform(NewTransform {
                    request_id,
                    name,
                    transform_metadata: work,
                    poll: self.deps.poll_state(),
                })
                .await?;
            created.push(transform.transform_id);
        }
        info!(request_id, transforms = created.len(), "transforms created");
        self.deps.publish(EventType::NewTransform, &created).await?;
        Ok(RequestUpdate::new(request_id).status(RequestStatus::Transforming))
    }

    async fn is_throttled(&self, site: &str) -> Result<bool> {
        let Some(throttler) = self.deps.store.throttler(site).await? else {
            return Ok(false);
        };
        let active = self.deps.store.active_counts(site).await?;
        Ok(throttler.is_exceeded_by(&active))
    }

    async fn process_update_request(&self, request_id: i64) -> Result<()> {
        let Some(request) = self.claim(request_id, RequestStatus::RUNNING).await? else {
            debug!(request_id, "request is not running");
            return Ok(());
        };
        let outcome = self.evaluate(&request).await;
        self.conclude(&request, "update_err", outcome).await
    }

    /// Next status of a running request, from its transforms.
    async fn evaluate(&self, request: &Request) -> Result<RequestUpdate> {
        use RequestStatus as R;

        let request_id = request.request_id;
        let transforms = self.deps.store.transforms_of_request(request_id).await?;
        let all_terminal = transforms.iter().all(|t| t.status.is_terminal());
        let settle = |done: RequestStatus, pending: RequestStatus| if all_terminal { done } else { pending };

        let status = match request.status {
            R::ToCancel | R::Cancelling => settle(R::Cancelled, R::Cancelling),
            R::ToSuspend | R::Suspending => {
                if !all_terminal {
                    self.push_down(&transforms, TransformStatus::ToSuspend).await?;
                }
                settle(R::Suspended, R::Suspending)
            }
            R::ToFinish | R::ToForceFinish => {
                if all_terminal {
                    aggregate(&transforms)
                } else {
                    let target = if request.status == R::ToForceFinish {
                        TransformStatus::ToForceFinish
                    } else {
                        TransformStatus::ToFinish
                    };
                    self.push_down(&transforms, target).await?;
                    request.status
                }
            }
            R::ToExpire | R::Expiring => settle(R::Expired, R::Expiring),
            R::ToResume | R::Resuming => {
                if !all_terminal {
                    R::Transforming
                } else if transforms
                    .iter()
                    .any(|t| TransformStatus::RESUMABLE.contains(&t.status))
                {
                    // Resume has not reached every transform yet.
                    R::Resuming
                } else {
                    aggregate(&transforms)
                }
            }
            _ if request.is_expired(Utc::now()) => {
                info!(request_id, "request expired");
                self.deps
                    .send_all(vec![self.deps.event(EventType::ExpireRequest, request_id)])
                    .await?;
                request.status
            }
            _ if transforms.is_empty() => {
                return Err(Error::Other(format!("request {request_id} has no transforms")));
            }
            _ => settle(aggregate(&transforms), R::Transforming),
        };
        Ok(RequestUpdate::new(request_id).status(status))
    }

    async fn process_abort_request(&self, event: &Event, request_id: i64) -> Result<()> {
        let result = self.abort(request_id).await;
        self.settle_commands(event, &result).await;
        result
    }

    async fn abort(&self, request_id: i64) -> Result<()> {
        let Some(request) = self.claim(request_id, RequestStatus::ALL).await? else {
            return Ok(());
        };
        if request.status.is_terminal() {
            info!(request_id, status = %request.status, "request already terminal, nothing to abort");
            return self.save(&request, RequestUpdate::new(request_id)).await;
        }
        let outcome = self
            .fan_out(request_id, EventType::AbortTransform, |s| !s.is_terminal())
            .await
            .map(|()| RequestUpdate::new(request_id).status(RequestStatus::ToCancel));
        self.conclude(&request, "abort_err", outcome).await
    }

    async fn process_resume_request(&self, event: &Event, request_id: i64) -> Result<()> {
        let result = self.resume(request_id).await;
        self.settle_commands(event, &result).await;
        result
    }

    async fn resume(&self, request_id: i64) -> Result<()> {
        use RequestStatus as R;

        let Some(request) = self.claim(request_id, RequestStatus::ALL).await? else {
            return Ok(());
        };
        if !matches!(
            request.status,
            R::SubFinished | R::Failed | R::Cancelled | R::Suspended | R::Expired
        ) {
            info!(request_id, status = %request.status, "request is not resumable");
            return self.save(&request, RequestUpdate::new(request_id)).await;
        }
        let fresh = self.deps.poll_state();
        let outcome = self
            .fan_out(request_id, EventType::ResumeTransform, |s| {
                TransformStatus::RESUMABLE.contains(&s)
            })
            .await
            .map(|()| RequestUpdate {
                poll: Some(PollState {
                    new_retries: 0,
                    update_retries: 0,
                    new_poll_period_secs: fresh.new_poll_period_secs,
                    update_poll_period_secs: fresh.update_poll_period_secs,
                    ..request.poll
                }),
                ..RequestUpdate::new(request_id).status(R::ToResume)
            });
        self.conclude(&request, "resume_err", outcome).await
    }

    async fn process_expire_request(&self, event: &Event, request_id: i64) -> Result<()> {
        let result = self.expire(request_id).await;
        self.settle_commands(event, &result).await;
        result
    }

    async fn expire(&self, request_id: i64) -> Result<()> {
        let Some(request) = self.claim(request_id, RequestStatus::ALL).await? else {
            return Ok(());
        };
        if request.status.is_terminal() {
            return self.save(&request, RequestUpdate::new(request_id)).await;
        }
        let outcome = self
            .fan_out(request_id, EventType::AbortTransform, |s| !s.is_terminal())
            .await
            .map(|()| RequestUpdate::new(request_id).status(RequestStatus::ToExpire));
        self.conclude(&request, "expire_err", outcome).await
    }

    /// Put every running transform into `target` and wake the transformer
    /// for it. A transform already under another operation keeps it; a
    /// busy one is tried again on the next poll.
    async fn push_down(&self, transforms: &[Transform], target: TransformStatus) -> Result<()> {
        const RUNNING: &[TransformStatus] = &[TransformStatus::Transforming, TransformStatus::Resuming];

        let mut pushed = Vec::new();
        for transform in transforms.iter().filter(|t| RUNNING.contains(&t.status)) {
            let id = transform.transform_id;
            let claimed = match self.deps.store.lock_transform(id, RUNNING).await? {
                Claim::Claimed(claimed) => claimed,
                Claim::Busy => {
                    debug!(transform_id = id, %target, "transform busy, pushing down later");
                    continue;
                }
                Claim::Ineligible => continue,
            };
            record_state_transition(&Span::current(), "transform", claimed.status.as_str(), target.as_str());
            let update = TransformUpdate::new(id).status(target);
            retry_transient("update_transform", || self.deps.store.update_transform(&update)).await?;
            pushed.push(id);
        }
        if !pushed.is_empty() {
            info!(count = pushed.len(), %target, "pushed down to transforms");
        }
        self.deps.publish(EventType::UpdateTransform, &pushed).await
    }

    /// Send `event_type` to every transform of the request whose status
    /// passes `pick`.
    async fn fan_out(&self, request_id: i64, event_type: EventType, pick: fn(TransformStatus) -> bool) -> Result<()> {
        let ids: Vec<i64> = self
            .deps
            .store
            .transforms_of_request(request_id)
            .await?
            .into_iter()
            .filter(|t| pick(t.status))
            .map(|t| t.transform_id)
            .collect();
        debug!(request_id, %event_type, count = ids.len(), "fanning out to transforms");
        self.deps.publish(event_type, &ids).await
    }

    /// Record the outcome on the commands behind `event`. A busy request
    /// leaves them in processing; the requeued event settles them later.
    async fn settle_commands(&self, event: &Event, result: &Result<()>) {
        let status = match result {
            Ok(()) => CommandStatus::Processed,
            Err(Error::Locked(_)) => return,
            Err(_) => CommandStatus::Failed,
        };
        for command_id in event.command_ids() {
            if let Err(e) = self.deps.store.update_command(command_id, status).await {
                warn!(command_id, "cannot update command: {e}");
            }
        }
    }
}

/// Final status of a request whose transforms are all terminal.
fn aggregate(transforms: &[Transform]) -> RequestStatus {
    let finished = transforms
        .iter()
        .filter(|t| t.status == TransformStatus::Finished)
        .count();
    if finished == transforms.len() {
        RequestStatus::Finished
    } else if finished > 0 || transforms.iter().any(|t| t.status == TransformStatus::SubFinished) {
        RequestStatus::SubFinished
    } else {
        RequestStatus::Failed
    }
}

#[async_trait]
impl Agent for Clerk {
    fn name(&self) -> &'static str {
        "clerk"
    }

    fn deps(&self) -> &AgentDeps {
        &self.deps
    }

    fn event_types(&self) -> &'static [EventType] {
        EVENT_TYPES
    }

    fn timers(&self) -> Vec<TimerSpec> {
        let config = &self.deps.config;
        let lease = u64::try_from(config.lock_lease_secs / 2).unwrap_or(0).max(60);
        vec![
            TimerSpec::new(NEW_REQUESTS, config.poll_period()).poller(),
            TimerSpec::new(RUNNING_REQUESTS, config.poll_period()).poller(),
            TimerSpec::new(OPERATION_REQUESTS, config.poll_operation_period()).poller(),
            TimerSpec::new(CLEAN_MIN_REQUEST_ID, Duration::from_secs(3600)),
            TimerSpec::new(CLEAN_LOCKS, Duration::from_secs(lease)),
        ]
    }

    async fn run_timer(&self, name: &'static str) -> Result<()> {
        match name {
            NEW_REQUESTS => {
                self.poll_requests(NEW_REQUESTS, RequestStatus::NEW, EventType::NewRequest)
                    .await
            }
            RUNNING_REQUESTS => {
                self.poll_requests(RUNNING_REQUESTS, RequestStatus::RUNNING, EventType::UpdateRequest)
                    .await
            }
            OPERATION_REQUESTS => self.poll_commands().await,
            CLEAN_MIN_REQUEST_ID => {
                self.deps.context.clean();
                Ok(())
            }
            CLEAN_LOCKS => self.clean_locks().await,
            other => Err(Error::Other(format!("clerk has no timer {other}"))),
        }
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        let request_id = subject(event)?;
        match event.event_type {
            EventType::NewRequest => self.process_new_request(request_id).await,
            EventType::UpdateRequest => self.process_update_request(request_id).await,
            EventType::AbortRequest => self.process_abort_request(event, request_id).await,
            EventType::ResumeRequest => self.process_resume_request(event, request_id).await,
            EventType::ExpireRequest => self.process_expire_request(event, request_id).await,
            other => Err(Error::Other(format!("clerk does not handle {other} events"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transforms(statuses: &[TransformStatus]) -> Vec<Transform> {
        let now = Utc::now();
        statuses
            .iter()
            .enumerate()
            .map(|(i, &status)| Transform {
                transform_id: i as i64 + 1,
                request_id: 1,
                name: format!("t{i}"),
                status,
                locking: Locking::Idle,
                transform_metadata: Value::Null,
                current_processing_id: None,
                errors: None,
                poll: PollState::default(),
                created_at: now,
                updated_at: now,
                next_poll_at: now,
            })
            .collect()
    }

    #[test]
    fn aggregation_of_terminal_transforms() {
        use TransformStatus::*;
        assert_eq!(aggregate(&transforms(&[Finished, Finished])), RequestStatus::Finished);
        assert_eq!(aggregate(&transforms(&[Finished, Failed])), RequestStatus::SubFinished);
        assert_eq!(aggregate(&transforms(&[SubFinished, Cancelled])), RequestStatus::SubFinished);
        assert_eq!(aggregate(&transforms(&[Failed, Cancelled])), RequestStatus::Failed);
    }
}
