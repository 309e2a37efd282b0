//! Transformer: gives every transform a processing and mirrors the
//! processing's status back onto the transform.

use super::retry::{error_entry, retry_transient};
use super::{Agent, AgentDeps, TimerSpec, subject};
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::{Claim, PollQuery};
use crate::telemetry::dispatch::record_state_transition;
use async_trait::async_trait;
use tracing::{Span, debug, info, warn};

const NEW_TRANSFORMS: &str = "get_new_transforms";
const RUNNING_TRANSFORMS: &str = "get_running_transforms";

const EVENT_TYPES: &[EventType] = &[
    EventType::NewTransform,
    EventType::UpdateTransform,
    EventType::AbortTransform,
    EventType::ResumeTransform,
];

pub struct Transformer {
    deps: AgentDeps,
}

impl Transformer {
    pub fn new(deps: AgentDeps) -> Self {
        Self { deps }
    }

    async fn poll_transforms(
        &self,
        poller: &'static str,
        statuses: &[TransformStatus],
        event_type: EventType,
    ) -> Result<()> {
        let query = PollQuery::new(statuses, self.deps.config.retrieve_bulk_size)
            .min_request_id(self.deps.context.window_floor(poller));
        let ids = self.deps.store.transforms_for_poll(&query).await?;
        if !ids.is_empty() {
            debug!(poller, count = ids.len(), "transforms due");
        }
        self.deps.publish(event_type, &ids).await
    }

    async fn claim(&self, transform_id: i64, statuses: &[TransformStatus]) -> Result<Option<Transform>> {
        self.deps
            .store
            .lock_transform(transform_id, statuses)
            .await?
            .into_claimed(|| format!("transform {transform_id}"))
    }

    /// Apply `update`, and tell the request when the transform went
    /// terminal.
    async fn save(&self, transform: &Transform, update: TransformUpdate) -> Result<()> {
        if let Some(to) = update.status {
            record_state_transition(&Span::current(), "transform", transform.status.as_str(), to.as_str());
        }
        retry_transient("update_transform", || self.deps.store.update_transform(&update)).await?;
        if update.status.is_some_and(TransformStatus::is_terminal) {
            self.deps
                .publish(EventType::UpdateRequest, &[transform.request_id])
                .await?;
        }
        Ok(())
    }

    async fn conclude(&self, transform: &Transform, error_key: &str, outcome: Result<TransformUpdate>) -> Result<()> {
        match outcome {
            Ok(update) => self.save(transform, update).await,
            Err(e) => {
                let mut poll = transform.poll;
                let exhausted = self
                    .deps
                    .retry_policy()
                    .on_error(&mut poll, transform.status.poll_phase());
                warn!(transform_id = transform.transform_id, exhausted, "transform handler failed: {e}");
                let update = TransformUpdate {
                    status: exhausted.then_some(TransformStatus::Failed),
                    errors: Some(error_entry(error_key, &e)),
                    poll: Some(poll),
                    ..TransformUpdate::new(transform.transform_id)
                };
                self.save(transform, update).await?;
                Err(e)
            }
        }
    }

    async fn process_new_transform(&self, transform_id: i64) -> Result<()> {
        let Some(transform) = self.claim(transform_id, TransformStatus::NEW).await? else {
            debug!(transform_id, "transform is no longer new");
            return Ok(());
        };
        let outcome = self.start_transform(&transform).await;
        self.conclude(&transform, "submit_err", outcome).await
    }

    async fn start_transform(&self, transform: &Transform) -> Result<TransformUpdate> {
        let processing_id = match transform.current_processing_id {
            // Created on an earlier attempt whose update did not land.
            Some(id) => id,
            None => {
                self.deps
                    .store
                    .insert_processing(NewProcessing {
                        transform_id: transform.transform_id,
                        request_id: transform.request_id,
                        processing_metadata: transform.transform_metadata.clone(),
                        poll: self.deps.poll_state(),
                    })
                    .await?
                    .processing_id
            }
        };
        info!(transform_id = transform.transform_id, processing_id, "processing created");
        self.deps
            .publish(EventType::NewProcessing, &[processing_id])
            .await?;
        Ok(TransformUpdate {
            current_processing_id: Some(processing_id),
            ..TransformUpdate::new(transform.transform_id).status(TransformStatus::Transforming)
        })
    }

    async fn process_update_transform(&self, transform_id: i64) -> Result<()> {
        let Some(transform) = self.claim(transform_id, TransformStatus::RUNNING).await? else {
            debug!(transform_id, "transform is not running");
            return Ok(());
        };
        let outcome = self.evaluate(&transform).await;
        self.conclude(&transform, "update_err", outcome).await
    }

    async fn evaluate(&self, transform: &Transform) -> Result<TransformUpdate> {
        use TransformStatus as T;

        let update = TransformUpdate::new(transform.transform_id);
        let Some(processing_id) = transform.current_processing_id else {
            warn!(transform_id = transform.transform_id, "running transform has no processing");
            return Ok(TransformUpdate {
                errors: Some(error_entry("update_err", &"transform has no processing")),
                ..update.status(T::Failed)
            });
        };
        let processing = self.deps.store.get_processing(processing_id).await?;
        let derived = TransformStatus::from_processing(processing.status);

        let status = match transform.status {
            T::ToCancel | T::Cancelling if !derived.is_terminal() => T::Cancelling,
            // The processing has not picked up the resume yet.
            T::ToResume | T::Resuming if ProcessingStatus::RESUMABLE.contains(&processing.status) => {
                T::Resuming
            }
            T::ToFinish | T::ToForceFinish | T::ToSuspend if !derived.is_terminal() => {
                let (target, next) = match transform.status {
                    T::ToSuspend => (ProcessingStatus::ToSuspend, T::Suspending),
                    T::ToForceFinish => (ProcessingStatus::ToForceFinish, T::Terminating),
                    _ => (ProcessingStatus::ToFinish, T::Terminating),
                };
                if self.push_down(processing_id, target).await? {
                    next
                } else {
                    transform.status
                }
            }
            T::Terminating | T::Suspending if !derived.is_terminal() => transform.status,
            _ => derived,
        };
        Ok(update.status(status))
    }

    /// Move an active processing into `target` for the carrier to act on.
    /// Returns `false` when the processing is busy and must be tried again.
    async fn push_down(&self, processing_id: i64, target: ProcessingStatus) -> Result<bool> {
        let processing = match self
            .deps
            .store
            .lock_processing(processing_id, ProcessingStatus::ACTIVE)
            .await?
        {
            Claim::Claimed(processing) => processing,
            Claim::Busy => return Ok(false),
            // Already handed over, or doing something else.
            Claim::Ineligible => return Ok(true),
        };
        record_state_transition(&Span::current(), "processing", processing.status.as_str(), target.as_str());
        let update = ProcessingUpdate::new(processing_id).status(target);
        retry_transient("update_processing", || self.deps.store.update_processing(&update)).await?;
        info!(processing_id, %target, "pushed down to processing");
        self.deps
            .publish(EventType::UpdateProcessing, &[processing_id])
            .await?;
        Ok(true)
    }

    async fn process_abort_transform(&self, transform_id: i64) -> Result<()> {
        let Some(transform) = self.claim(transform_id, TransformStatus::ALL).await? else {
            return Ok(());
        };
        let update = TransformUpdate::new(transform_id);
        if transform.status.is_terminal() {
            return self.save(&transform, update).await;
        }
        let outcome = match transform.current_processing_id {
            Some(processing_id) => self
                .deps
                .publish(EventType::AbortProcessing, &[processing_id])
                .await
                .map(|()| update.status(TransformStatus::ToCancel)),
            None => Ok(update.status(TransformStatus::Cancelled)),
        };
        self.conclude(&transform, "abort_err", outcome).await
    }

    async fn process_resume_transform(&self, transform_id: i64) -> Result<()> {
        let Some(transform) = self.claim(transform_id, TransformStatus::ALL).await? else {
            return Ok(());
        };
        let update = TransformUpdate::new(transform_id);
        if !TransformStatus::RESUMABLE.contains(&transform.status) {
            debug!(transform_id, status = %transform.status, "transform is not resumable");
            return self.save(&transform, update).await;
        }
        let fresh = self.deps.poll_state();
        let update = TransformUpdate {
            poll: Some(PollState {
                new_retries: 0,
                update_retries: 0,
                new_poll_period_secs: fresh.new_poll_period_secs,
                update_poll_period_secs: fresh.update_poll_period_secs,
                ..transform.poll
            }),
            ..update
        };
        let outcome = match transform.current_processing_id {
            Some(processing_id) => self
                .deps
                .publish(EventType::ResumeProcessing, &[processing_id])
                .await
                .map(|()| update.status(TransformStatus::ToResume)),
            // Never got a processing: start over.
            None => Ok(update.status(TransformStatus::New)),
        };
        self.conclude(&transform, "resume_err", outcome).await
    }
}

#[async_trait]
impl Agent for Transformer {
    fn name(&self) -> &'static str {
        "transformer"
    }

    fn deps(&self) -> &AgentDeps {
        &self.deps
    }

    fn event_types(&self) -> &'static [EventType] {
        EVENT_TYPES
    }

    fn timers(&self) -> Vec<TimerSpec> {
        let period = self.deps.config.poll_period();
        vec![
            TimerSpec::new(NEW_TRANSFORMS, period).poller(),
            TimerSpec::new(RUNNING_TRANSFORMS, period).poller(),
        ]
    }

    async fn run_timer(&self, name: &'static str) -> Result<()> {
        match name {
            NEW_TRANSFORMS => {
                self.poll_transforms(NEW_TRANSFORMS, TransformStatus::NEW, EventType::NewTransform)
                    .await
            }
            RUNNING_TRANSFORMS => {
                self.poll_transforms(
                    RUNNING_TRANSFORMS,
                    TransformStatus::RUNNING,
                    EventType::UpdateTransform,
                )
                .await
            }
            other => Err(Error::Other(format!("transformer has no timer {other}"))),
        }
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        let transform_id = subject(event)?;
        match event.event_type {
            EventType::NewTransform => self.process_new_transform(transform_id).await,
            EventType::UpdateTransform => self.process_update_transform(transform_id).await,
            EventType::AbortTransform => self.process_abort_transform(transform_id).await,
            EventType::ResumeTransform => self.process_resume_transform(transform_id).await,
            other => Err(Error::Other(format!("transformer does not handle {other} events"))),
        }
    }
}
