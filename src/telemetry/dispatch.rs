//! Span helpers for event handling.

use crate::model::Event;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use tracing::Span;

/// Span covering one handler invocation.
pub fn start_event_span(agent: &str, event: &Event) -> Span {
    tracing::info_span!(
        "event.handle",
        "agent" = agent,
        "event.id" = %event.id,
        "event.type" = %event.event_type,
        "event.subject" = event.subject,
        "event.counter" = event.counter,
    )
}

/// Log a status change on `span` and count it.
pub fn record_state_transition(span: &Span, entity: &'static str, from: &str, to: &str) {
    if from == to {
        return;
    }
    span.in_scope(|| {
        tracing::info!(entity, from, to, "state_transition");
    });
    metrics::state_transitions().add(
        1,
        &[
            KeyValue::new("entity", entity),
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}
