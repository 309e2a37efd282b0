//! Coordinator side of the broker: a REP socket in front of a backend.
//!
//! The backend is whatever the coordinator is configured with: usually
//! its own coalescing queue, or another event bus for layered setups.
//! Malformed or unauthenticated requests get an `error` reply; nothing a
//! client sends stops the loop.

use super::wire::{self, BrokerReply, BrokerRequest};
use crate::error::Result;
use crate::eventbus::EventBusBackend;
use crate::shutdown::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use zeromq::{RepSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

pub struct BrokerServer {
    bind_addr: String,
    username: String,
    password: String,
    backend: Arc<dyn EventBusBackend>,
    max_get_wait: Duration,
}

impl BrokerServer {
    pub fn new(bind_addr: impl Into<String>, backend: Arc<dyn EventBusBackend>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            username: String::new(),
            password: String::new(),
            backend,
            max_get_wait: Duration::from_secs(1),
        }
    }

    /// Require these credentials on every request. Empty means open.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Bind the REP socket. The returned listener reports the actual
    /// endpoint, which matters when binding to port 0.
    pub async fn bind(self) -> Result<BrokerListener> {
        let mut socket = RepSocket::new();
        let endpoint = socket.bind(&self.bind_addr).await?;
        let endpoint = endpoint.to_string();
        info!(%endpoint, "broker coordinator bound");
        Ok(BrokerListener {
            socket,
            endpoint,
            server: self,
        })
    }

    /// Answer one raw request.
    pub async fn handle(&self, raw: &str) -> BrokerReply {
        let envelope = match wire::decode_envelope(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("rejecting request: {e}");
                return BrokerReply::error(e.to_string());
            }
        };
        if !self.username.is_empty()
            && (envelope.username != self.username || envelope.password != self.password)
        {
            warn!(username = %envelope.username, "rejecting request with bad credentials");
            return BrokerReply::error("authentication failed");
        }

        let kind = envelope.request.kind();
        let outcome = match envelope.request {
            BrokerRequest::SendEvent { event } => self
                .backend
                .send(event)
                .await
                .map(|()| BrokerReply::SendEventRet(true)),
            BrokerRequest::SendBulk { events } => self
                .backend
                .send_bulk(events)
                .await
                .map(|()| BrokerReply::SendBulkRet(true)),
            BrokerRequest::GetEvent {
                event_type,
                num_events,
                wait_ms,
            } => {
                let wait = Duration::from_millis(wait_ms).min(self.max_get_wait);
                self.backend
                    .get(event_type, num_events, wait)
                    .await
                    .map(BrokerReply::GetEventRet)
            }
        };
        outcome.unwrap_or_else(|e| {
            warn!(kind, "coordinator backend error: {e}");
            BrokerReply::error(e.to_string())
        })
    }
}

pub struct BrokerListener {
    socket: RepSocket,
    endpoint: String,
    server: BrokerServer,
}

impl BrokerListener {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Serve requests until `shutdown` fires.
    pub async fn serve(mut self, shutdown: Shutdown) -> Result<()> {
        loop {
            let message = tokio::select! {
                _ = shutdown.wait() => {
                    info!(endpoint = %self.endpoint, "broker coordinator stopping");
                    return Ok(());
                }
                message = self.socket.recv() => message,
            };

            let reply = match message {
                Ok(message) => match String::try_from(message) {
                    Ok(raw) => self.server.handle(&raw).await,
                    Err(e) => BrokerReply::error(format!("request is not utf-8 text: {e}")),
                },
                Err(e) => {
                    warn!("broker receive failed: {e}");
                    continue;
                }
            };

            let encoded = match wire::encode(&reply) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!("cannot encode reply: {e}");
                    r#"{"type":"error","ret":null}"#.to_string()
                }
            };
            if let Err(e) = self.socket.send(ZmqMessage::from(encoded)).await {
                warn!("broker reply failed: {e}");
            } else {
                debug!("broker reply sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventbus::coalescing::CoalescingBackend;
    use crate::model::{Event, EventType};
    use crate::eventbus::broker::wire::Envelope;

    fn server() -> BrokerServer {
        let backend = Arc::new(CoalescingBackend::new(
            Duration::from_secs(180),
            Duration::from_secs(3600),
        ));
        BrokerServer::new("tcp://127.0.0.1:0", backend).credentials("idds", "pw")
    }

    fn request(username: &str, request: BrokerRequest) -> String {
        wire::encode(&Envelope {
            username: username.into(),
            password: "pw".into(),
            request,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn send_then_get_through_handler() {
        let server = server();
        let event = Event::about(EventType::NewRequest, 3);
        let reply = server
            .handle(&request("idds", BrokerRequest::SendEvent { event: event.clone() }))
            .await;
        assert_eq!(reply, BrokerReply::SendEventRet(true));

        let reply = server
            .handle(&request(
                "idds",
                BrokerRequest::GetEvent {
                    event_type: EventType::NewRequest,
                    num_events: 5,
                    wait_ms: 0,
                },
            ))
            .await;
        assert_eq!(reply, BrokerReply::GetEventRet(vec![event]));
    }

    #[tokio::test(start_paused = true)]
    async fn sub_second_get_wait_is_kept() {
        let server = server();
        let start = tokio::time::Instant::now();
        let reply = server
            .handle(&request(
                "idds",
                BrokerRequest::GetEvent {
                    event_type: EventType::NewRequest,
                    num_events: 1,
                    wait_ms: 400,
                },
            ))
            .await;
        assert_eq!(reply, BrokerReply::GetEventRet(vec![]));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(400), "waited {waited:?}");
        assert!(waited < Duration::from_secs(1), "waited {waited:?}");
    }

    #[tokio::test]
    async fn bad_credentials_and_garbage_get_error_replies() {
        let server = server();
        let reply = server
            .handle(&request(
                "mallory",
                BrokerRequest::SendBulk { events: vec![] },
            ))
            .await;
        assert!(matches!(reply, BrokerReply::Error(Some(_))));

        let reply = server.handle("not json at all").await;
        assert!(matches!(reply, BrokerReply::Error(Some(_))));
    }
}
