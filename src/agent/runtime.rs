//! Runs one agent: a timer loop for its pollers and housekeeping, and a
//! dispatch loop feeding bus events to a bounded pool of handler tasks.

use super::Agent;
use super::timer::{TimerQueue, TimerSpec};
use crate::error::{Error, Result};
use crate::model::{Event, Heartbeat};
use crate::shutdown::Shutdown;
use crate::telemetry::dispatch::start_event_span;
use crate::telemetry::metrics;
use chrono::Utc;
use opentelemetry::KeyValue;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

const HEARTBEAT: &str = "heartbeat";

pub struct AgentRuntime {
    agent: Arc<dyn Agent>,
    shutdown: Shutdown,
    workers: Arc<Semaphore>,
    max_workers: usize,
    /// Start time of every handler in flight, by event id.
    running: Mutex<HashMap<Uuid, Instant>>,
    hostname: String,
}

impl AgentRuntime {
    pub fn new(agent: Arc<dyn Agent>, shutdown: Shutdown) -> Self {
        let max_workers = agent.deps().config.max_number_workers.max(1);
        Self {
            agent,
            shutdown,
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            running: Mutex::new(HashMap::new()),
            hostname: hostname(),
        }
    }

    pub fn free_workers(&self) -> usize {
        self.workers.available_permits()
    }

    /// Run until shutdown. Handlers already started are allowed to finish
    /// before this returns.
    pub async fn run(self) -> Result<()> {
        let this = Arc::new(self);
        let agent = this.agent.name();
        info!(
            agent,
            id = %this.agent.deps().id,
            workers = this.max_workers,
            "agent started"
        );

        let timers = tokio::spawn({
            let this = Arc::clone(&this);
            async move { this.timer_loop().await }
        });
        this.dispatch_loop().await;
        if let Err(e) = timers.await {
            error!(agent, "timer loop panicked: {e}");
        }

        // Every permit back means every handler is done.
        let _drained = this
            .workers
            .acquire_many(this.max_workers as u32)
            .await
            .map_err(|e| Error::Other(e.to_string()))?;
        info!(agent, "agent stopped");
        Ok(())
    }

    async fn timer_loop(&self) {
        let agent = self.agent.name();
        let mut specs = self.agent.timers();
        specs.push(TimerSpec::new(HEARTBEAT, self.agent.deps().config.heartbeat_delay()).priority(u8::MAX));
        let mut queue = TimerQueue::new(specs, Instant::now());

        while let Some(next) = queue.next_at() {
            tokio::select! {
                _ = self.shutdown.wait() => return,
                _ = tokio::time::sleep_until(next) => {}
            }
            let now = Instant::now();
            while let Some(index) = queue.pop_due(now) {
                if self.shutdown.is_triggered() {
                    return;
                }
                let spec = queue.spec(index).clone();
                if spec.needs_free_workers && self.free_workers() == 0 {
                    debug!(agent, timer = spec.name, "all workers busy, skipping");
                } else if let Err(e) = self.run_timer(spec.name).await {
                    error!(agent, timer = spec.name, "timer task failed: {e}");
                }
                queue.reschedule(index, Instant::now());
            }
        }
    }

    async fn run_timer(&self, name: &'static str) -> Result<()> {
        if name == HEARTBEAT {
            self.heartbeat().await
        } else {
            self.agent.run_timer(name).await
        }
    }

    async fn dispatch_loop(self: &Arc<Self>) {
        let deps = self.agent.deps();
        let delay = deps.config.event_interval_delay();

        while !self.shutdown.is_triggered() {
            for &event_type in self.agent.event_types() {
                let free = self.free_workers();
                if free == 0 {
                    break;
                }
                let events = match deps.bus.get(event_type, free, Duration::ZERO).await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(agent = self.agent.name(), %event_type, "event bus get failed: {e}");
                        continue;
                    }
                };
                for event in events {
                    let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                        return;
                    };
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        this.dispatch(event).await;
                        drop(permit);
                    });
                }
            }

            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run the handler for one event and settle the event with the bus.
    async fn dispatch(&self, mut event: Event) {
        let agent = self.agent.name();
        let deps = self.agent.deps();
        let span = start_event_span(agent, &event);
        let labels = [
            KeyValue::new("agent", agent),
            KeyValue::new("event_type", event.event_type.as_str()),
        ];
        metrics::events_dispatched().add(1, &labels);

        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.id, Instant::now());
        let started = Instant::now();
        let result = self.agent.handle_event(&event).instrument(span.clone()).await;
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&event.id);
        metrics::handler_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &labels);

        let outcome = match result {
            Ok(()) => {
                if let Err(e) = deps.bus.clean_event(&event).await {
                    warn!(agent, event_id = %event.id, "clean_event failed: {e}");
                }
                "processed"
            }
            Err(Error::Locked(what)) => {
                if let Err(e) = deps.bus.fail_event(&event).await {
                    warn!(agent, event_id = %event.id, "fail_event failed: {e}");
                }
                if event.requeue_counter < deps.config.max_event_requeues {
                    debug!(agent, %what, "entity busy, requeueing event");
                    event.requeue();
                    if let Err(e) = deps.bus.send(event).await {
                        warn!(agent, "requeue failed: {e}");
                    }
                } else {
                    warn!(agent, %what, "entity still busy, dropping event");
                }
                "locked"
            }
            Err(e) => {
                span.in_scope(|| error!(agent, "handler failed: {e}"));
                if let Err(e) = deps.bus.fail_event(&event).await {
                    warn!(agent, event_id = %event.id, "fail_event failed: {e}");
                }
                "failed"
            }
        };
        metrics::events_completed().add(
            1,
            &[
                KeyValue::new("agent", agent),
                KeyValue::new("outcome", outcome),
            ],
        );
    }

    /// Report liveness and worker usage, and drop heartbeats of agents
    /// that stopped reporting.
    async fn heartbeat(&self) -> Result<()> {
        let deps = self.agent.deps();
        let max_exec = deps.config.max_worker_exec_time();
        let (active, hung) = {
            let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            let hung = running.values().filter(|at| at.elapsed() > max_exec).count();
            (running.len(), hung)
        };
        if hung > 0 {
            warn!(agent = self.agent.name(), hung, "handlers over max execution time");
        }

        let now = Utc::now();
        deps.store
            .heartbeat(&Heartbeat {
                agent: self.agent.name().to_string(),
                hostname: self.hostname.clone(),
                pid: std::process::id(),
                thread_id: deps.id.clone(),
                payload: json!({
                    "num_active_workers": active,
                    "num_hang_workers": hung,
                    "max_number_workers": self.max_workers,
                }),
                updated_at: now,
            })
            .await?;
        let stale = now - chrono::Duration::seconds(2 * deps.config.heartbeat_delay_secs as i64);
        deps.store.clean_heartbeats(stale).await?;
        Ok(())
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}
