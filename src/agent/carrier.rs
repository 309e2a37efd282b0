//! Carrier: submits processings to the workload system and follows them
//! until they settle.

use super::debounce::TerminalDebounce;
use super::retry::{error_entry, retry_transient};
use super::{Agent, AgentDeps, TimerSpec, subject};
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::PollQuery;
use crate::telemetry::dispatch::record_state_transition;
use crate::workload::WorkloadClient;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{Span, debug, info, warn};

const NEW_PROCESSINGS: &str = "get_new_processings";
const RUNNING_PROCESSINGS: &str = "get_running_processings";

const EVENT_TYPES: &[EventType] = &[
    EventType::NewProcessing,
    EventType::UpdateProcessing,
    EventType::AbortProcessing,
    EventType::ResumeProcessing,
];

pub struct Carrier {
    deps: AgentDeps,
    client: Arc<dyn WorkloadClient>,
    debounce: TerminalDebounce,
}

impl Carrier {
    pub fn new(deps: AgentDeps, client: Arc<dyn WorkloadClient>) -> Self {
        let debounce = TerminalDebounce::new(deps.config.terminal_confirmations);
        Self {
            deps,
            client,
            debounce,
        }
    }

    async fn poll_processings(
        &self,
        poller: &'static str,
        statuses: &[ProcessingStatus],
        event_type: EventType,
    ) -> Result<()> {
        let query = PollQuery::new(statuses, self.deps.config.retrieve_bulk_size)
            .min_request_id(self.deps.context.window_floor(poller));
        let ids = self.deps.store.processings_for_poll(&query).await?;
        if !ids.is_empty() {
            debug!(poller, count = ids.len(), "processings due");
        }
        self.deps.publish(event_type, &ids).await
    }

    async fn claim(&self, processing_id: i64, statuses: &[ProcessingStatus]) -> Result<Option<Processing>> {
        self.deps
            .store
            .lock_processing(processing_id, statuses)
            .await?
            .into_claimed(|| format!("processing {processing_id}"))
    }

    async fn save(&self, processing: &Processing, update: ProcessingUpdate) -> Result<()> {
        if let Some(to) = update.status {
            record_state_transition(&Span::current(), "processing", processing.status.as_str(), to.as_str());
        }
        retry_transient("update_processing", || self.deps.store.update_processing(&update)).await?;
        if update.status.is_some_and(ProcessingStatus::is_terminal) {
            self.deps
                .publish(EventType::UpdateTransform, &[processing.transform_id])
                .await?;
        }
        Ok(())
    }

    async fn conclude(
        &self,
        processing: &Processing,
        error_key: &str,
        outcome: Result<ProcessingUpdate>,
    ) -> Result<()> {
        match outcome {
            Ok(update) => self.save(processing, update).await,
            Err(e) => {
                let mut poll = processing.poll;
                let exhausted = self
                    .deps
                    .retry_policy()
                    .on_error(&mut poll, processing.status.poll_phase());
                warn!(
                    processing_id = processing.processing_id,
                    exhausted, "processing handler failed: {e}"
                );
                let update = ProcessingUpdate {
                    status: exhausted.then_some(ProcessingStatus::Failed),
                    errors: Some(error_entry(error_key, &e)),
                    poll: Some(poll),
                    ..ProcessingUpdate::new(processing.processing_id)
                };
                self.save(processing, update).await?;
                Err(e)
            }
        }
    }

    async fn process_new_processing(&self, processing_id: i64) -> Result<()> {
        let Some(processing) = self.claim(processing_id, ProcessingStatus::NEW).await? else {
            debug!(processing_id, "processing is no longer new");
            return Ok(());
        };
        let outcome = self.submit(&processing).await;
        self.conclude(&processing, "submit_err", outcome).await
    }

    async fn submit(&self, processing: &Processing) -> Result<ProcessingUpdate> {
        let workload_id = match &processing.workload_id {
            Some(id) => id.clone(),
            None => self.client.submit(processing).await?,
        };
        info!(processing_id = processing.processing_id, %workload_id, "processing submitted");
        Ok(ProcessingUpdate {
            workload_id: Some(workload_id),
            submitted_at: Some(Utc::now()),
            polling_retries: Some(0),
            ..ProcessingUpdate::new(processing.processing_id).status(ProcessingStatus::Submitted)
        })
    }

    async fn process_update_processing(&self, event: &Event, processing_id: i64) -> Result<()> {
        let Some(processing) = self.claim(processing_id, ProcessingStatus::RUNNING).await? else {
            debug!(processing_id, "processing is not running");
            return Ok(());
        };
        let outcome = self.track(&processing, event.has_updates()).await;
        self.conclude(&processing, "update_err", outcome).await
    }

    /// Poll the workload and decide what to report.
    ///
    /// A finish or suspend handed down by the transformer is passed on to
    /// the workload first; the processing then stays `Terminating` or
    /// `Suspending` until the workload settles. Suspending stops the
    /// workload the way a soft finish does, and anything short of a full
    /// finish is reported as `Suspended` so a resume can pick it up.
    async fn track(&self, processing: &Processing, has_updates: bool) -> Result<ProcessingUpdate> {
        use ProcessingStatus as P;

        let workload_id = workload_id(processing)?;
        if matches!(processing.status, P::ToFinish | P::ToForceFinish | P::ToSuspend) {
            let soft = processing.status != P::ToForceFinish;
            self.client.finish(workload_id, soft).await?;
            info!(
                processing_id = processing.processing_id,
                status = %processing.status,
                soft,
                "finish requested"
            );
        }

        let external = self.client.poll(workload_id).await?;
        let observation = self.debounce.observe(
            processing.polling_retries,
            external.status,
            external.pending_updates || has_updates,
        );
        if observation.status != external.status {
            debug!(
                processing_id = processing.processing_id,
                observed = %external.status,
                confirmations = observation.polling_retries,
                "holding terminal status"
            );
        }
        let settled = observation.status.is_terminal();
        let status = match processing.status {
            P::ToFinish | P::ToForceFinish | P::Terminating if !settled => P::Terminating,
            P::ToSuspend | P::Suspending if !settled => P::Suspending,
            P::ToSuspend | P::Suspending if observation.status != P::Finished => P::Suspended,
            _ => observation.status,
        };
        Ok(ProcessingUpdate {
            polling_retries: Some(observation.polling_retries),
            ..ProcessingUpdate::new(processing.processing_id).status(status)
        })
    }

    async fn process_abort_processing(&self, processing_id: i64) -> Result<()> {
        let Some(processing) = self.claim(processing_id, ProcessingStatus::ALL).await? else {
            return Ok(());
        };
        if processing.status.is_terminal() {
            return self
                .save(&processing, ProcessingUpdate::new(processing_id))
                .await;
        }
        let outcome = match &processing.workload_id {
            Some(workload_id) => self.client.kill(workload_id).await,
            None => Ok(()),
        }
        .map(|()| ProcessingUpdate::new(processing_id).status(ProcessingStatus::Cancelled));
        self.conclude(&processing, "abort_err", outcome).await
    }

    async fn process_resume_processing(&self, processing_id: i64) -> Result<()> {
        let Some(processing) = self.claim(processing_id, ProcessingStatus::ALL).await? else {
            return Ok(());
        };
        if !ProcessingStatus::RESUMABLE.contains(&processing.status) {
            debug!(processing_id, status = %processing.status, "processing is not resumable");
            return self
                .save(&processing, ProcessingUpdate::new(processing_id))
                .await;
        }
        let fresh = self.deps.poll_state();
        let update = ProcessingUpdate {
            polling_retries: Some(0),
            poll: Some(PollState {
                new_retries: 0,
                update_retries: 0,
                new_poll_period_secs: fresh.new_poll_period_secs,
                update_poll_period_secs: fresh.update_poll_period_secs,
                ..processing.poll
            }),
            ..ProcessingUpdate::new(processing_id)
        };
        let outcome = match &processing.workload_id {
            Some(workload_id) => self
                .client
                .retry(workload_id)
                .await
                .map(|()| update.status(ProcessingStatus::Resuming)),
            // Never submitted: submit again.
            None => Ok(update.status(ProcessingStatus::New)),
        };
        self.conclude(&processing, "resume_err", outcome).await
    }
}

fn workload_id(processing: &Processing) -> Result<&str> {
    processing.workload_id.as_deref().ok_or_else(|| {
        Error::Workload(format!(
            "processing {} has no workload id",
            processing.processing_id
        ))
    })
}

#[async_trait]
impl Agent for Carrier {
    fn name(&self) -> &'static str {
        "carrier"
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
            TimerSpec::new(NEW_PROCESSINGS, period).poller(),
            TimerSpec::new(RUNNING_PROCESSINGS, period).poller(),
        ]
    }

    async fn run_timer(&self, name: &'static str) -> Result<()> {
        match name {
            NEW_PROCESSINGS => {
                self.poll_processings(NEW_PROCESSINGS, ProcessingStatus::NEW, EventType::NewProcessing)
                    .await
            }
            RUNNING_PROCESSINGS => {
                self.poll_processings(
                    RUNNING_PROCESSINGS,
                    ProcessingStatus::RUNNING,
                    EventType::UpdateProcessing,
                )
                .await
            }
            other => Err(Error::Other(format!("carrier has no timer {other}"))),
        }
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        let processing_id = subject(event)?;
        match event.event_type {
            EventType::NewProcessing => self.process_new_processing(processing_id).await,
            EventType::UpdateProcessing => self.process_update_processing(event, processing_id).await,
            EventType::AbortProcessing => self.process_abort_processing(processing_id).await,
            EventType::ResumeProcessing => self.process_resume_processing(processing_id).await,
            other => Err(Error::Other(format!("carrier does not handle {other} events"))),
        }
    }
}
