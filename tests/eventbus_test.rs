//! Event bus behaviour through the facade: merging, bounded gets, and
//! failover between a broker primary and the local fallback.

use async_trait::async_trait;
use idds_rs::error::Result;
use idds_rs::eventbus::broker::HealthPolicy;
use idds_rs::eventbus::{
    BrokerBackend, BrokerServer, BrokerSettings, CoalescingBackend, EventBus, EventBusBackend,
    MemoryBackend,
};
use idds_rs::model::{Event, EventType};
use idds_rs::shutdown::Shutdown;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// In-process primary whose health the test switches by hand.
#[derive(Default)]
struct Switchable {
    inner: MemoryBackend,
    healthy: AtomicBool,
}

#[async_trait]
impl EventBusBackend for Switchable {
    fn name(&self) -> &'static str {
        "switchable"
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.inner.send(event).await
    }

    async fn get(&self, event_type: EventType, num_events: usize, wait: Duration) -> Result<Vec<Event>> {
        self.inner.get(event_type, num_events, wait).await
    }

    async fn clean_event(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn fail_event(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn is_ok(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

fn coalescing() -> Arc<CoalescingBackend> {
    Arc::new(CoalescingBackend::new(
        Duration::from_secs(180),
        Duration::from_secs(3600),
    ))
}

/// A port nothing listens on, at least for a moment.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn fragile(addr: String) -> BrokerSettings {
    BrokerSettings {
        socket_timeout: Duration::from_millis(300),
        policy: HealthPolicy {
            failure_threshold: 1,
            timeout_threshold: 1,
            failure_timeout: Duration::from_secs(1),
            max_recoveries: 10,
        },
        ..BrokerSettings::new(addr)
    }
}

#[tokio::test]
async fn updates_about_one_request_merge() {
    let bus = EventBus::local();
    for part in ["a", "b", "c"] {
        bus.send(Event::about(EventType::UpdateRequest, 42).content(json!({ "parts": [part] })))
            .await
            .unwrap();
    }
    bus.send(Event::about(EventType::UpdateRequest, 7)).await.unwrap();

    let events = bus
        .get(EventType::UpdateRequest, 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(events.len(), 2);
    let merged = events.iter().find(|e| e.subject == Some(42)).unwrap();
    assert_eq!(merged.counter, 3);
    assert_eq!(merged.content, Some(json!({ "parts": ["a", "b", "c"] })));
}

#[tokio::test]
async fn get_is_bounded_and_never_repeats() {
    let bus = EventBus::local();
    let events: Vec<Event> = (1..=25)
        .map(|id| Event::about(EventType::NewProcessing, id))
        .collect();
    bus.send_bulk(events).await.unwrap();

    let mut seen = HashSet::new();
    loop {
        let batch = bus
            .get(EventType::NewProcessing, 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(batch.len() <= 10);
        if batch.is_empty() {
            break;
        }
        for event in batch {
            assert!(seen.insert(event.subject.unwrap()), "event handed out twice");
        }
    }
    assert_eq!(seen.len(), 25);
}

#[tokio::test]
async fn get_waits_no_longer_than_asked() {
    let bus = EventBus::local();
    let started = tokio::time::Instant::now();
    let events = bus
        .get(EventType::NewRequest, 5, Duration::from_millis(200))
        .await
        .unwrap();
    assert!(events.is_empty());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn broker_round_trip() {
    let queue = coalescing();
    let listener = BrokerServer::new("tcp://127.0.0.1:0", queue.clone() as Arc<dyn EventBusBackend>)
        .credentials("idds", "secret")
        .bind()
        .await
        .unwrap();
    let endpoint = listener.endpoint().to_string();
    let shutdown = Shutdown::new();
    let server = tokio::spawn(listener.serve(shutdown.clone()));

    let client = BrokerBackend::new(BrokerSettings {
        username: "idds".into(),
        password: "secret".into(),
        ..BrokerSettings::new(endpoint)
    });
    client
        .send(Event::about(EventType::NewTransform, 5))
        .await
        .unwrap();
    assert_eq!(queue.len(EventType::NewTransform).await, 1);

    let events = client
        .get(EventType::NewTransform, 10, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].subject, Some(5));
    assert!(client.is_ok().await);

    shutdown.trigger();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn unreachable_broker_fails_over_and_back() {
    let primary = Arc::new(BrokerBackend::new(fragile(format!(
        "tcp://127.0.0.1:{}",
        free_port()
    ))));
    let fallback = coalescing();
    let bus = EventBus::new(
        primary.clone() as Arc<dyn EventBusBackend>,
        fallback.clone() as Arc<dyn EventBusBackend>,
    );

    // Failed sends are cached, not lost, and the bus still reports success.
    for id in [1, 2] {
        bus.send(Event::about(EventType::UpdateRequest, id)).await.unwrap();
    }
    assert_eq!(primary.cached().await, 2);

    bus.send(Event::about(EventType::UpdateRequest, 3)).await.unwrap();
    assert!(bus.is_on_fallback());
    let events = bus
        .get(EventType::UpdateRequest, 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].subject, Some(3));

    // A probe that fails again does not bring the primary back early.
    primary.maintain_once().await;
    bus.send(Event::about(EventType::UpdateRequest, 6)).await.unwrap();
    assert!(bus.is_on_fallback());

    // After the failure timeout the primary gets another chance.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    bus.send(Event::about(EventType::UpdateRequest, 4)).await.unwrap();
    assert!(!bus.is_on_fallback());
}

#[tokio::test]
async fn cached_events_are_replayed_once_the_broker_answers() {
    let port = free_port();
    let addr = format!("tcp://127.0.0.1:{port}");
    let client = BrokerBackend::new(fragile(addr.clone()));
    for id in [1, 2, 3] {
        client.send(Event::about(EventType::UpdateProcessing, id)).await.unwrap();
    }
    assert_eq!(client.cached().await, 3);

    let queue = coalescing();
    let listener = BrokerServer::new(addr, queue.clone() as Arc<dyn EventBusBackend>)
        .bind()
        .await
        .unwrap();
    let shutdown = Shutdown::new();
    let server = tokio::spawn(listener.serve(shutdown.clone()));

    client.maintain_once().await;
    assert_eq!(client.cached().await, 0);
    assert_eq!(queue.len(EventType::UpdateProcessing).await, 3);

    shutdown.trigger();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn fallback_events_move_to_the_recovered_primary() {
    let primary = Arc::new(Switchable::default());
    let fallback = coalescing();
    let bus = EventBus::new(
        primary.clone() as Arc<dyn EventBusBackend>,
        fallback.clone() as Arc<dyn EventBusBackend>,
    );

    bus.send(Event::about(EventType::AbortRequest, 3).with_command(77))
        .await
        .unwrap();
    bus.send(Event::about(EventType::UpdateTransform, 8)).await.unwrap();
    assert!(bus.is_on_fallback());
    assert_eq!(fallback.len(EventType::AbortRequest).await, 1);

    primary.healthy.store(true, Ordering::SeqCst);
    let events = bus
        .get(EventType::AbortRequest, 10, Duration::ZERO)
        .await
        .unwrap();
    assert!(!bus.is_on_fallback());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].command_ids(), vec![77]);

    assert_eq!(fallback.len(EventType::AbortRequest).await, 0);
    assert_eq!(fallback.len(EventType::UpdateTransform).await, 0);
    assert_eq!(primary.inner.len(EventType::UpdateTransform).await, 1);
}

#[tokio::test]
async fn recovered_broker_waits_out_the_failure_timeout() {
    let addr = format!("tcp://127.0.0.1:{}", free_port());
    let primary = Arc::new(BrokerBackend::new(fragile(addr.clone())));
    let fallback = coalescing();
    let bus = EventBus::new(
        primary.clone() as Arc<dyn EventBusBackend>,
        fallback.clone() as Arc<dyn EventBusBackend>,
    );
    for id in [1, 2] {
        bus.send(Event::about(EventType::UpdateRequest, id)).await.unwrap();
    }
    bus.send(Event::about(EventType::AbortRequest, 3).with_command(77))
        .await
        .unwrap();
    assert!(bus.is_on_fallback());

    // The coordinator comes back and answers a probe, but the failure is
    // still recent.
    let queue = coalescing();
    let listener = BrokerServer::new(addr, queue.clone() as Arc<dyn EventBusBackend>)
        .bind()
        .await
        .unwrap();
    let shutdown = Shutdown::new();
    let server = tokio::spawn(listener.serve(shutdown.clone()));
    primary.maintain_once().await;
    assert!(!primary.is_ok().await);
    assert_eq!(primary.cached().await, 2);

    bus.send(Event::about(EventType::UpdateRequest, 5)).await.unwrap();
    assert!(bus.is_on_fallback());
    assert_eq!(queue.len(EventType::UpdateRequest).await, 0);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let events = bus
        .get(EventType::AbortRequest, 10, Duration::ZERO)
        .await
        .unwrap();
    assert!(!bus.is_on_fallback());
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].command_ids(), vec![77]);
    assert_eq!(fallback.len(EventType::UpdateRequest).await, 0);

    primary.maintain_once().await;
    assert_eq!(primary.cached().await, 0);
    assert_eq!(queue.len(EventType::UpdateRequest).await, 3);

    shutdown.trigger();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn abandoned_get_leaves_the_broker_client_usable() {
    let queue = coalescing();
    let listener = BrokerServer::new("tcp://127.0.0.1:0", queue.clone() as Arc<dyn EventBusBackend>)
        .bind()
        .await
        .unwrap();
    let endpoint = listener.endpoint().to_string();
    let shutdown = Shutdown::new();
    let server = tokio::spawn(listener.serve(shutdown.clone()));
    let client = BrokerBackend::new(BrokerSettings {
        socket_timeout: Duration::from_secs(5),
        ..BrokerSettings::new(endpoint)
    });

    // The coordinator holds the get for up to a second; give up well before.
    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        client.get(EventType::NewRequest, 10, Duration::from_secs(1)),
    )
    .await;
    assert!(abandoned.is_err());

    client
        .send(Event::about(EventType::NewRequest, 9))
        .await
        .unwrap();
    assert_eq!(client.cached().await, 0);
    assert_eq!(queue.len(EventType::NewRequest).await, 1);

    let events = client
        .get(EventType::NewRequest, 10, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].subject, Some(9));
    assert!(client.is_ok().await);

    shutdown.trigger();
    server.await.unwrap().unwrap();
}
