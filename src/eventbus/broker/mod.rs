//! Event bus backend that talks to a remote coordinator over ZeroMQ
//! REQ/REP.
//!
//! Every call is a single request/reply exchange bounded by the socket
//! timeout. Failed sends are kept in a local cache and replayed once the
//! coordinator answers again. A background task probes the coordinator
//! while it is failing and flushes the cache when it recovers.

pub mod health;
pub mod server;
pub mod wire;

pub use health::{BrokerHealth, HealthPolicy};
pub use server::{BrokerListener, BrokerServer};
pub use wire::{BrokerReply, BrokerRequest, Envelope};

use super::EventBusBackend;
use crate::config::EventBusConfig;
use crate::config::secrets::expose_or_empty;
use crate::error::{Error, Result};
use crate::model::{Event, EventType};
use crate::shutdown::Shutdown;
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

/// Connection settings for a broker client.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub addr: String,
    pub username: String,
    pub password: String,
    pub socket_timeout: Duration,
    pub health_check_interval: Duration,
    pub policy: HealthPolicy,
}

impl BrokerSettings {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            username: String::new(),
            password: String::new(),
            socket_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(60),
            policy: HealthPolicy::default(),
        }
    }

    pub fn from_config(config: &EventBusConfig) -> Self {
        Self {
            addr: config.coordinator_addr.clone(),
            username: config.username.clone().unwrap_or_default(),
            password: expose_or_empty(config.password.as_ref()),
            socket_timeout: Duration::from_secs(config.socket_timeout_secs),
            health_check_interval: Duration::from_secs(config.health_check_interval_secs),
            policy: HealthPolicy {
                failure_threshold: config.failure_threshold,
                timeout_threshold: config.timeout_threshold,
                failure_timeout: Duration::from_secs(config.failure_timeout_secs),
                max_recoveries: config.max_recoveries,
            },
        }
    }
}

pub struct BrokerBackend {
    settings: BrokerSettings,
    socket: Mutex<Option<ReqSocket>>,
    health: Mutex<BrokerHealth>,
    cache: Mutex<Vec<Event>>,
    shutdown: Shutdown,
}

impl BrokerBackend {
    pub fn new(settings: BrokerSettings) -> Self {
        let health = BrokerHealth::new(settings.policy);
        Self {
            settings,
            socket: Mutex::new(None),
            health: Mutex::new(health),
            cache: Mutex::new(Vec::new()),
            shutdown: Shutdown::new(),
        }
    }

    /// Create the backend and start its maintenance task.
    pub fn start(settings: BrokerSettings) -> (Arc<Self>, JoinHandle<()>) {
        let backend = Arc::new(Self::new(settings));
        let task = tokio::spawn(Arc::clone(&backend).maintain());
        (backend, task)
    }

    /// Events waiting to be replayed to the coordinator.
    pub async fn cached(&self) -> usize {
        self.cache.lock().await.len()
    }

    async fn exchange(&self, request: BrokerRequest) -> Result<BrokerReply> {
        let kind = request.kind();
        let payload = wire::encode(&Envelope {
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
            request,
        })?;

        // The socket is taken out for the exchange and only put back once
        // a reply arrived. An exchange abandoned midway drops it, so the
        // next one never reads a stale reply.
        let mut slot = self.socket.lock().await;
        let taken = slot.take();
        let attempt = async {
            let mut active = match taken {
                Some(active) => active,
                None => {
                    let mut fresh = ReqSocket::new();
                    fresh.connect(&self.settings.addr).await?;
                    fresh
                }
            };
            active.send(ZmqMessage::from(payload)).await?;
            let reply = active.recv().await?;
            let raw = String::try_from(reply).map_err(|e| Error::Broker(e.to_string()))?;
            Ok::<_, Error>((active, wire::decode_reply(&raw)))
        };
        let result = tokio::time::timeout(self.settings.socket_timeout, attempt).await;

        let result = match result {
            Ok(Ok((active, decoded))) => {
                *slot = Some(active);
                Ok(decoded)
            }
            Ok(Err(e)) => Ok(Err(e)),
            Err(elapsed) => Err(elapsed),
        };
        drop(slot);

        match result {
            Err(_) => {
                self.health.lock().await.record_timeout();
                Err(Error::BrokerTimeout(self.settings.socket_timeout))
            }
            Ok(Err(e)) => {
                self.health.lock().await.record_failure();
                Err(e)
            }
            Ok(Ok(BrokerReply::Error(message))) => {
                self.health.lock().await.record_failure();
                Err(Error::Broker(format!(
                    "coordinator rejected {kind}: {}",
                    message.unwrap_or_else(|| "no detail".to_string())
                )))
            }
            Ok(Ok(reply)) => {
                self.health.lock().await.record_success();
                Ok(reply)
            }
        }
    }

    async fn stash(&self, events: Vec<Event>, error: &Error) {
        warn!(
            count = events.len(),
            addr = %self.settings.addr,
            "broker send failed, caching events: {error}"
        );
        self.cache.lock().await.extend(events);
    }

    /// Periodic probe and cache replay, until stopped.
    async fn maintain(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.wait() => return,
                _ = tokio::time::sleep(self.settings.health_check_interval) => {}
            }
            self.maintain_once().await;
        }
    }

    /// One maintenance round: probe the coordinator if recent exchanges
    /// failed, then replay cached events if it is usable.
    pub async fn maintain_once(&self) {
        if self.health.lock().await.has_errors() {
            let probe = Event::new(EventType::Test);
            match self.exchange(BrokerRequest::SendEvent { event: probe }).await {
                Ok(_) => {
                    let _ = self
                        .exchange(BrokerRequest::GetEvent {
                            event_type: EventType::Test,
                            num_events: 1,
                            wait_ms: 0,
                        })
                        .await;
                    debug!(addr = %self.settings.addr, "broker probe succeeded");
                }
                Err(e) => debug!(addr = %self.settings.addr, "broker probe failed: {e}"),
            }
        }

        if !self.is_ok().await {
            return;
        }
        let events = std::mem::take(&mut *self.cache.lock().await);
        if events.is_empty() {
            return;
        }
        let count = events.len();
        match self
            .exchange(BrokerRequest::SendBulk {
                events: events.clone(),
            })
            .await
        {
            Ok(_) => info!(count, "replayed cached events to broker"),
            Err(e) => {
                let mut cache = self.cache.lock().await;
                let newer = std::mem::replace(&mut *cache, events);
                cache.extend(newer);
                debug!(count, "replay to broker failed: {e}");
            }
        }
    }
}

#[async_trait]
impl EventBusBackend for BrokerBackend {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn send(&self, event: Event) -> Result<()> {
        let event_type = event.event_type;
        match self
            .exchange(BrokerRequest::SendEvent {
                event: event.clone(),
            })
            .await
        {
            Ok(_) => {
                metrics::events_sent().add(
                    1,
                    &[
                        KeyValue::new("backend", "broker"),
                        KeyValue::new("event_type", event_type.as_str()),
                    ],
                );
            }
            Err(e) => self.stash(vec![event], &e).await,
        }
        Ok(())
    }

    async fn send_bulk(&self, events: Vec<Event>) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        if let Err(e) = self
            .exchange(BrokerRequest::SendBulk {
                events: events.clone(),
            })
            .await
        {
            self.stash(events, &e).await;
        }
        Ok(())
    }

    async fn get(&self, event_type: EventType, num_events: usize, wait: Duration) -> Result<Vec<Event>> {
        if num_events == 0 {
            return Ok(Vec::new());
        }
        // Keep the remote wait well inside the socket timeout.
        let wait_ms = u64::try_from(wait.min(self.settings.socket_timeout / 2).as_millis())
            .unwrap_or(u64::MAX);
        match self
            .exchange(BrokerRequest::GetEvent {
                event_type,
                num_events,
                wait_ms,
            })
            .await
        {
            Ok(BrokerReply::GetEventRet(events)) => Ok(events),
            Ok(other) => Err(Error::Broker(format!("unexpected reply to get_event: {other:?}"))),
            Err(e) => {
                debug!(%event_type, "broker get failed: {e}");
                Ok(Vec::new())
            }
        }
    }

    async fn clean_event(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn fail_event(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn is_ok(&self) -> bool {
        self.health.lock().await.is_ok(Instant::now())
    }

    async fn stop(&self) {
        self.shutdown.trigger();
    }
}
