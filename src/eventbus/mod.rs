//! Event bus: the facade agents publish to and consume from.
//!
//! The bus routes every call to a primary backend, or to a local
//! coalescing fallback while the primary reports itself unhealthy. When
//! the primary recovers, whatever piled up on the fallback is handed over
//! to it before calls are routed back. It is built once at startup and
//! shared by `Arc`.

pub mod broker;
pub mod coalescing;
pub mod db;
pub mod memory;

use crate::config::{BackendKind, EventBusConfig};
use crate::db::Db;
use crate::error::{Error, Result};
use crate::model::{Event, EventType};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use broker::{BrokerBackend, BrokerServer, BrokerSettings};
pub use coalescing::CoalescingBackend;
pub use db::DbBackend;
pub use memory::MemoryBackend;

/// Events moved per call while handing the fallback over to the primary.
const HANDOVER_BATCH: usize = 1000;

/// A queue of events, partitioned by event type.
///
/// `get` returns between zero and `num_events` events. A local backend
/// never waits longer than `wait`; a remote one may add its round trip,
/// which it bounds itself. An event returned by `get` is not returned
/// again unless it is sent again.
#[async_trait]
pub trait EventBusBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, event: Event) -> Result<()>;

    async fn send_bulk(&self, events: Vec<Event>) -> Result<()> {
        for event in events {
            self.send(event).await?;
        }
        Ok(())
    }

    async fn get(&self, event_type: EventType, num_events: usize, wait: Duration) -> Result<Vec<Event>>;

    /// The event was handled.
    async fn clean_event(&self, event: &Event) -> Result<()>;

    /// The event's handler failed.
    async fn fail_event(&self, event: &Event) -> Result<()>;

    async fn is_ok(&self) -> bool {
        true
    }

    async fn stop(&self) {}
}

pub struct EventBus {
    primary: Arc<dyn EventBusBackend>,
    fallback: Arc<dyn EventBusBackend>,
    on_fallback: AtomicBool,
    max_wait: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl EventBus {
    pub fn new(primary: Arc<dyn EventBusBackend>, fallback: Arc<dyn EventBusBackend>) -> Self {
        Self {
            primary,
            fallback,
            on_fallback: AtomicBool::new(false),
            max_wait: Duration::from_secs(10),
            tasks: Vec::new(),
        }
    }

    /// A bus over a single in-process coalescing queue.
    pub fn local() -> Self {
        let config = EventBusConfig::default();
        let queue: Arc<dyn EventBusBackend> = Arc::new(CoalescingBackend::new(
            config.max_delay(),
            config.clean_interval(),
        ));
        Self::new(Arc::clone(&queue), queue)
    }

    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    /// Build the bus described by `config`. The database backend needs
    /// `db`; the broker backend starts its maintenance task here.
    pub fn from_config(config: &EventBusConfig, db: Option<Arc<Db>>) -> Result<Self> {
        let fallback: Arc<dyn EventBusBackend> = Arc::new(CoalescingBackend::new(
            config.max_delay(),
            config.clean_interval(),
        ));
        let mut tasks = Vec::new();
        let primary: Arc<dyn EventBusBackend> = match config.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::Coalescing => Arc::clone(&fallback),
            BackendKind::Database => {
                let db = db.ok_or_else(|| {
                    Error::Config("database event bus backend needs a database".to_string())
                })?;
                Arc::new(
                    DbBackend::new(db, config.to_archive)
                        .processing_lease(Duration::from_secs(config.processing_lease_secs)),
                )
            }
            BackendKind::Broker => {
                let (backend, task) = BrokerBackend::start(BrokerSettings::from_config(config));
                tasks.push(task);
                backend
            }
        };
        info!(backend = primary.name(), "event bus ready");
        let mut bus = Self::new(primary, fallback).max_wait(config.get_wait());
        bus.tasks = tasks;
        Ok(bus)
    }

    /// The backend calls are currently routed to.
    pub async fn active_backend(&self) -> &Arc<dyn EventBusBackend> {
        let healthy = self.primary.is_ok().await;
        let was_on_fallback = self.on_fallback.swap(!healthy, Ordering::SeqCst);
        if healthy && was_on_fallback {
            info!(backend = self.primary.name(), "event bus primary recovered");
            self.hand_over().await;
            metrics::eventbus_failover().add(
                1,
                &[
                    KeyValue::new("backend", self.primary.name()),
                    KeyValue::new("direction", "to_primary"),
                ],
            );
        } else if !healthy && !was_on_fallback {
            warn!(
                backend = self.primary.name(),
                "event bus primary unhealthy, using local fallback"
            );
            metrics::eventbus_failover().add(
                1,
                &[
                    KeyValue::new("backend", self.primary.name()),
                    KeyValue::new("direction", "to_fallback"),
                ],
            );
        }
        if healthy { &self.primary } else { &self.fallback }
    }

    /// Move every event queued on the fallback to the primary. Events the
    /// primary refuses go back to the fallback.
    async fn hand_over(&self) {
        if Arc::ptr_eq(&self.primary, &self.fallback) {
            return;
        }
        let mut moved = 0;
        for event_type in EventType::ALL {
            loop {
                let events = match self
                    .fallback
                    .get(*event_type, HANDOVER_BATCH, Duration::ZERO)
                    .await
                {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(%event_type, "reading fallback during handover failed: {e}");
                        break;
                    }
                };
                if events.is_empty() {
                    break;
                }
                let count = events.len();
                if let Err(e) = self.primary.send_bulk(events.clone()).await {
                    warn!(%event_type, count, "handover to primary failed, keeping events local: {e}");
                    if let Err(e) = self.fallback.send_bulk(events).await {
                        warn!(%event_type, count, "requeueing on fallback failed: {e}");
                    }
                    break;
                }
                for event in &events {
                    let _ = self.fallback.clean_event(event).await;
                }
                moved += count;
            }
        }
        if moved > 0 {
            info!(
                count = moved,
                backend = self.primary.name(),
                "handed fallback events over to primary"
            );
        }
    }

    pub fn is_on_fallback(&self) -> bool {
        self.on_fallback.load(Ordering::SeqCst)
    }

    pub async fn send(&self, event: Event) -> Result<()> {
        self.active_backend().await.send(event).await
    }

    pub async fn send_bulk(&self, events: Vec<Event>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.active_backend().await.send_bulk(events).await
    }

    pub async fn get(&self, event_type: EventType, num_events: usize, wait: Duration) -> Result<Vec<Event>> {
        let wait = wait.min(self.max_wait);
        self.active_backend()
            .await
            .get(event_type, num_events, wait)
            .await
    }

    pub async fn clean_event(&self, event: &Event) -> Result<()> {
        self.active_backend().await.clean_event(event).await
    }

    pub async fn fail_event(&self, event: &Event) -> Result<()> {
        self.active_backend().await.fail_event(event).await
    }

    pub async fn stop(&self) {
        self.primary.stop().await;
        self.fallback.stop().await;
        for task in &self.tasks {
            task.abort();
        }
    }
}
