//! Integration tests for telemetry initialization and span helpers.

use idds_rs::model::{Event, EventType};
use idds_rs::telemetry::{TelemetryConfig, dispatch, init_telemetry, metrics};
use opentelemetry::KeyValue;

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can be set once per process; another test may
    // have won the race, which is fine here.
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: None,
        service_name: "idds-test".to_string(),
        log_level: "debug".to_string(),
    });
}

#[test]
fn event_span_records_transitions() {
    let event = Event::about(EventType::UpdateProcessing, 12);
    let span = dispatch::start_event_span("carrier", &event);
    let _enter = span.enter();
    dispatch::record_state_transition(&span, "processing", "running", "finished");
    // Unchanged status is not a transition.
    dispatch::record_state_transition(&span, "processing", "running", "running");
}

#[test]
fn instruments_are_usable_without_a_provider() {
    metrics::events_sent().add(
        1,
        &[
            KeyValue::new("backend", "memory"),
            KeyValue::new("event_type", "new_request"),
        ],
    );
    metrics::eventbus_failover().add(1, &[KeyValue::new("direction", "to_fallback")]);
    metrics::handler_duration_ms().record(3.5, &[KeyValue::new("agent", "clerk")]);
}
