//! Agents end to end over the in-process store and bus, with a scripted
//! workload system standing in for the task server.

use async_trait::async_trait;
use idds_rs::agent::{Agent, AgentContext, AgentDeps, AgentRuntime, Carrier, Clerk, Transformer};
use idds_rs::config::AgentConfig;
use idds_rs::error::{Error, Result};
use idds_rs::eventbus::EventBus;
use idds_rs::model::*;
use idds_rs::shutdown::Shutdown;
use idds_rs::store::{MemoryStore, Store};
use idds_rs::workload::{ExternalStatus, WorkloadClient};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Task server double: every submitted task reports whatever status the
/// test scripted for it.
#[derive(Default)]
struct ScriptedWorkload {
    submitted: Mutex<Vec<String>>,
    statuses: Mutex<HashMap<String, Vec<ExternalStatus>>>,
    killed: Mutex<Vec<String>>,
    retried: Mutex<Vec<String>>,
    finished: Mutex<Vec<(String, bool)>>,
}

impl ScriptedWorkload {
    /// Answer the next polls of every task with `script`, then keep
    /// repeating its last entry.
    fn script_all(&self, script: &[ExternalStatus]) {
        let submitted = self.submitted.lock().unwrap().clone();
        let mut statuses = self.statuses.lock().unwrap();
        for id in submitted {
            statuses.insert(id, script.iter().rev().copied().collect());
        }
    }
}

#[async_trait]
impl WorkloadClient for ScriptedWorkload {
    async fn submit(&self, processing: &Processing) -> Result<String> {
        let id = format!("task-{}", processing.processing_id);
        self.submitted.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn poll(&self, workload_id: &str) -> Result<ExternalStatus> {
        let mut statuses = self.statuses.lock().unwrap();
        let script = statuses
            .get_mut(workload_id)
            .ok_or_else(|| Error::Workload(format!("unknown task {workload_id}")))?;
        let status = if script.len() > 1 { script.pop() } else { script.last().copied() };
        status.ok_or_else(|| Error::Workload("empty script".into()))
    }

    async fn kill(&self, workload_id: &str) -> Result<()> {
        self.killed.lock().unwrap().push(workload_id.to_string());
        Ok(())
    }

    async fn retry(&self, workload_id: &str) -> Result<()> {
        self.retried.lock().unwrap().push(workload_id.to_string());
        Ok(())
    }

    async fn finish(&self, workload_id: &str, soft: bool) -> Result<()> {
        self.finished
            .lock()
            .unwrap()
            .push((workload_id.to_string(), soft));
        Ok(())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    workload: Arc<ScriptedWorkload>,
    clerk: Clerk,
    transformer: Transformer,
    carrier: Carrier,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::local());
        let context = Arc::new(AgentContext::new());
        let workload = Arc::new(ScriptedWorkload::default());
        let deps = || {
            AgentDeps::new(
                AgentConfig::default(),
                Arc::clone(&bus),
                Arc::clone(&store) as Arc<dyn Store>,
                Arc::clone(&context),
            )
        };
        Self {
            clerk: Clerk::new(deps()),
            transformer: Transformer::new(deps()),
            carrier: Carrier::new(deps(), Arc::clone(&workload) as Arc<dyn WorkloadClient>),
            store,
            workload,
        }
    }

    /// Hand every queued event of `agent` to its handler.
    async fn pump(&self, agent: &dyn Agent) -> usize {
        let bus = &agent.deps().bus;
        let mut handled = 0;
        for &event_type in agent.event_types() {
            for event in bus.get(event_type, 100, Duration::ZERO).await.unwrap() {
                agent.handle_event(&event).await.unwrap();
                bus.clean_event(&event).await.unwrap();
                handled += 1;
            }
        }
        handled
    }

    /// Pump all three agents until nothing is left on the bus.
    async fn settle(&self) {
        loop {
            let handled = self.pump(&self.clerk).await
                + self.pump(&self.transformer).await
                + self.pump(&self.carrier).await;
            if handled == 0 {
                return;
            }
        }
    }

    /// One round of the running-entity pollers.
    async fn poll_running(&self, request_id: i64) {
        self.store.make_due(request_id).await;
        self.carrier.run_timer("get_running_processings").await.unwrap();
        self.settle().await;
    }

    async fn submit(&self, works: Vec<serde_json::Value>) -> i64 {
        let request = self
            .store
            .insert_request(NewRequest::new("reco", "alice").works(works))
            .await
            .unwrap();
        self.clerk.run_timer("get_new_requests").await.unwrap();
        self.settle().await;
        request.request_id
    }

    /// Operator status change on a running request, then one round of the
    /// running-request poller.
    async fn operate(&self, request_id: i64, status: RequestStatus) {
        let claim = self
            .store
            .lock_request(request_id, &[RequestStatus::Transforming])
            .await
            .unwrap();
        assert!(matches!(claim, idds_rs::store::Claim::Claimed(_)));
        self.store
            .update_request(&RequestUpdate::new(request_id).status(status))
            .await
            .unwrap();
        self.store.make_due(request_id).await;
        self.clerk.run_timer("get_running_requests").await.unwrap();
        self.settle().await;
    }

    async fn processings(&self, request_id: i64) -> Vec<Processing> {
        let mut out = Vec::new();
        for transform in self.store.transforms_of_request(request_id).await.unwrap() {
            if let Some(pid) = transform.current_processing_id {
                out.push(self.store.get_processing(pid).await.unwrap());
            }
        }
        out
    }
}

fn status(status: ProcessingStatus) -> ExternalStatus {
    ExternalStatus::new(status)
}

#[tokio::test]
async fn new_request_reaches_the_workload_system() {
    let h = Harness::new();
    let request_id = h.submit(vec![json!({"name": "a"}), json!({"name": "b"})]).await;

    let request = h.store.get_request(request_id).await.unwrap();
    assert_eq!(request.status, RequestStatus::Transforming);
    assert_eq!(request.locking, Locking::Idle);

    let transforms = h.store.transforms_of_request(request_id).await.unwrap();
    assert_eq!(transforms.len(), 2);
    assert!(transforms.iter().all(|t| t.status == TransformStatus::Transforming));

    let processings = h.processings(request_id).await;
    assert_eq!(processings.len(), 2);
    for p in &processings {
        assert_eq!(p.status, ProcessingStatus::Submitted);
        assert!(p.workload_id.is_some());
        assert!(p.submitted_at.is_some());
    }
    assert_eq!(h.workload.submitted.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn finished_tasks_finish_the_request_after_three_polls() {
    let h = Harness::new();
    let request_id = h.submit(vec![json!({"name": "a"}), json!({"name": "b"})]).await;
    h.workload.script_all(&[status(ProcessingStatus::Finished)]);

    for round in 1..=2 {
        h.poll_running(request_id).await;
        for p in h.processings(request_id).await {
            assert_eq!(p.status, ProcessingStatus::Running, "round {round}");
            assert_eq!(p.polling_retries, round);
        }
        let request = h.store.get_request(request_id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Transforming);
    }

    h.poll_running(request_id).await;
    for p in h.processings(request_id).await {
        assert_eq!(p.status, ProcessingStatus::Finished);
    }
    let request = h.store.get_request(request_id).await.unwrap();
    assert_eq!(request.status, RequestStatus::Finished);
}

#[tokio::test]
async fn flapping_task_is_never_reported_terminal() {
    let h = Harness::new();
    let request_id = h.submit(vec![json!({"name": "a"})]).await;
    h.workload.script_all(&[
        status(ProcessingStatus::Finished),
        status(ProcessingStatus::Running),
        status(ProcessingStatus::Finished),
        status(ProcessingStatus::Finished),
        status(ProcessingStatus::Running),
    ]);

    for _ in 0..5 {
        h.poll_running(request_id).await;
        for p in h.processings(request_id).await {
            assert!(!p.status.is_terminal(), "reported {}", p.status);
        }
    }
    let request = h.store.get_request(request_id).await.unwrap();
    assert_eq!(request.status, RequestStatus::Transforming);
}

#[tokio::test]
async fn pending_updates_hold_a_failed_task() {
    let h = Harness::new();
    let request_id = h.submit(vec![json!({"name": "a"})]).await;
    let pending = ExternalStatus {
        status: ProcessingStatus::Failed,
        pending_updates: true,
    };
    h.workload.script_all(&[pending, pending, pending, pending]);

    for _ in 0..4 {
        h.poll_running(request_id).await;
        for p in h.processings(request_id).await {
            assert_eq!(p.status, ProcessingStatus::Running);
            assert_eq!(p.polling_retries, 0);
        }
    }
}

#[tokio::test]
async fn mixed_outcomes_sub_finish_the_request() {
    let h = Harness::new();
    let request_id = h.submit(vec![json!({"name": "a"}), json!({"name": "b"})]).await;

    let processings = h.processings(request_id).await;
    {
        let mut statuses = h.workload.statuses.lock().unwrap();
        statuses.insert(
            processings[0].workload_id.clone().unwrap(),
            vec![status(ProcessingStatus::Finished)],
        );
        statuses.insert(
            processings[1].workload_id.clone().unwrap(),
            vec![status(ProcessingStatus::Failed)],
        );
    }
    for _ in 0..3 {
        h.poll_running(request_id).await;
    }

    let request = h.store.get_request(request_id).await.unwrap();
    assert_eq!(request.status, RequestStatus::SubFinished);
}

#[tokio::test]
async fn abort_command_cancels_down_the_chain() {
    let h = Harness::new();
    let request_id = h.submit(vec![json!({"name": "a"})]).await;

    h.store
        .insert_command(NewCommand::new(request_id, CommandType::AbortRequest))
        .await
        .unwrap();
    h.clerk.run_timer("get_operation_requests").await.unwrap();
    h.settle().await;

    assert_eq!(h.workload.killed.lock().unwrap().len(), 1);
    for p in h.processings(request_id).await {
        assert_eq!(p.status, ProcessingStatus::Cancelled);
    }
    let transforms = h.store.transforms_of_request(request_id).await.unwrap();
    assert!(transforms.iter().all(|t| t.status == TransformStatus::Cancelled));
    let request = h.store.get_request(request_id).await.unwrap();
    assert_eq!(request.status, RequestStatus::Cancelled);

    // The command was consumed.
    assert!(h.store.claim_new_commands(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn resume_brings_a_failed_request_back() {
    let h = Harness::new();
    let request_id = h.submit(vec![json!({"name": "a"})]).await;
    h.workload.script_all(&[status(ProcessingStatus::Failed)]);
    for _ in 0..3 {
        h.poll_running(request_id).await;
    }
    assert_eq!(
        h.store.get_request(request_id).await.unwrap().status,
        RequestStatus::Failed
    );

    h.store
        .insert_command(NewCommand::new(request_id, CommandType::ResumeRequest))
        .await
        .unwrap();
    h.clerk.run_timer("get_operation_requests").await.unwrap();
    h.settle().await;

    assert_eq!(h.workload.retried.lock().unwrap().len(), 1);
    for p in h.processings(request_id).await {
        assert_eq!(p.status, ProcessingStatus::Resuming);
        assert_eq!(p.polling_retries, 0);
    }

    h.workload.script_all(&[status(ProcessingStatus::Finished)]);
    for _ in 0..3 {
        h.poll_running(request_id).await;
    }
    assert_eq!(
        h.store.get_request(request_id).await.unwrap().status,
        RequestStatus::Finished
    );
}

#[tokio::test]
async fn finish_reaches_the_workload_and_settles_the_request() {
    let h = Harness::new();
    let request_id = h.submit(vec![json!({"name": "a"}), json!({"name": "b"})]).await;
    h.workload.script_all(&[status(ProcessingStatus::Running)]);

    h.operate(request_id, RequestStatus::ToFinish).await;

    let finished = h.workload.finished.lock().unwrap().clone();
    assert_eq!(finished.len(), 2);
    assert!(finished.iter().all(|(_, soft)| *soft));
    for p in h.processings(request_id).await {
        assert_eq!(p.status, ProcessingStatus::Terminating);
    }
    let transforms = h.store.transforms_of_request(request_id).await.unwrap();
    assert!(transforms.iter().all(|t| t.status == TransformStatus::Terminating));
    assert_eq!(
        h.store.get_request(request_id).await.unwrap().status,
        RequestStatus::ToFinish
    );

    // Still running: the processing keeps terminating.
    h.poll_running(request_id).await;
    for p in h.processings(request_id).await {
        assert_eq!(p.status, ProcessingStatus::Terminating);
    }

    h.workload.script_all(&[status(ProcessingStatus::Finished)]);
    for _ in 0..3 {
        h.poll_running(request_id).await;
    }
    assert_eq!(
        h.store.get_request(request_id).await.unwrap().status,
        RequestStatus::Finished
    );
    // Asked once per task, not on every poll.
    assert_eq!(h.workload.finished.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn force_finish_is_not_soft() {
    let h = Harness::new();
    let request_id = h.submit(vec![json!({"name": "a"})]).await;
    h.workload.script_all(&[status(ProcessingStatus::Running)]);

    h.operate(request_id, RequestStatus::ToForceFinish).await;

    let finished = h.workload.finished.lock().unwrap().clone();
    assert_eq!(finished.len(), 1);
    assert!(!finished[0].1);
}

#[tokio::test]
async fn suspended_request_can_be_resumed() {
    let h = Harness::new();
    let request_id = h.submit(vec![json!({"name": "a"})]).await;
    h.workload.script_all(&[status(ProcessingStatus::Running)]);

    h.operate(request_id, RequestStatus::ToSuspend).await;
    assert_eq!(h.workload.finished.lock().unwrap().len(), 1);
    for p in h.processings(request_id).await {
        assert_eq!(p.status, ProcessingStatus::Suspending);
    }

    h.workload.script_all(&[status(ProcessingStatus::SubFinished)]);
    for _ in 0..3 {
        h.poll_running(request_id).await;
    }
    for p in h.processings(request_id).await {
        assert_eq!(p.status, ProcessingStatus::Suspended);
    }
    let transforms = h.store.transforms_of_request(request_id).await.unwrap();
    assert!(transforms.iter().all(|t| t.status == TransformStatus::Suspended));
    assert_eq!(
        h.store.get_request(request_id).await.unwrap().status,
        RequestStatus::Suspended
    );

    h.store
        .insert_command(NewCommand::new(request_id, CommandType::ResumeRequest))
        .await
        .unwrap();
    h.clerk.run_timer("get_operation_requests").await.unwrap();
    h.settle().await;
    assert_eq!(h.workload.retried.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn throttled_site_holds_new_requests() {
    let h = Harness::new();
    h.store
        .upsert_throttler(&Throttler {
            site: "CERN".into(),
            num_requests: Some(0),
            num_transforms: None,
            num_processings: None,
        })
        .await
        .unwrap();
    let request = h
        .store
        .insert_request(NewRequest::new("reco", "alice").site("CERN"))
        .await
        .unwrap();
    h.clerk.run_timer("get_new_requests").await.unwrap();
    h.settle().await;

    let request = h.store.get_request(request.request_id).await.unwrap();
    assert_eq!(request.status, RequestStatus::Throttling);
    assert!(
        h.store
            .transforms_of_request(request.request_id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn busy_request_surfaces_as_locked() {
    let h = Harness::new();
    let request = h
        .store
        .insert_request(NewRequest::new("reco", "alice"))
        .await
        .unwrap();
    let claim = h
        .store
        .lock_request(request.request_id, RequestStatus::NEW)
        .await
        .unwrap();
    assert!(matches!(claim, idds_rs::store::Claim::Claimed(_)));

    let event = Event::about(EventType::NewRequest, request.request_id);
    let result = h.clerk.handle_event(&event).await;
    assert!(matches!(result, Err(Error::Locked(_))));
}

#[tokio::test]
async fn unknown_commands_are_marked() {
    let h = Harness::new();
    let request = h
        .store
        .insert_request(NewRequest::new("reco", "alice"))
        .await
        .unwrap();
    h.store
        .insert_command(NewCommand {
            request_id: request.request_id,
            transform_id: None,
            cmd_type: "reboot_universe".into(),
            cmd_content: None,
        })
        .await
        .unwrap();
    h.clerk.run_timer("get_operation_requests").await.unwrap();
    assert_eq!(h.pump(&h.clerk).await, 0);
    assert!(h.store.claim_new_commands(10).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn runtime_writes_heartbeats_and_stops() {
    let store = Arc::new(MemoryStore::new());
    let deps = AgentDeps::new(
        AgentConfig::default(),
        Arc::new(EventBus::local()),
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(AgentContext::new()),
    );
    let shutdown = Shutdown::new();
    let runtime = AgentRuntime::new(Arc::new(Clerk::new(deps)), shutdown.clone());
    let handle = tokio::spawn(runtime.run());

    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.trigger();
    handle.await.unwrap().unwrap();

    let heartbeats = store.heartbeats().await;
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].agent, "clerk");
    assert_eq!(heartbeats[0].payload["max_number_workers"], json!(8));
}
