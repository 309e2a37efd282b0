//! Metric instruments for the event bus and the agents.
//!
//! Instruments come from the globally registered `MeterProvider`; without
//! an OTLP endpoint they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("idds-rs")
}

/// Counter: events accepted by a backend.
/// Labels: `backend`, `event_type`.
pub fn events_sent() -> Counter<u64> {
    meter()
        .u64_counter("idds.events.sent")
        .with_description("Events accepted by the event bus")
        .build()
}

/// Counter: events folded into an already queued event.
/// Labels: `backend`, `event_type`.
pub fn events_merged() -> Counter<u64> {
    meter()
        .u64_counter("idds.events.merged")
        .with_description("Events merged into a pending event")
        .build()
}

/// Counter: events handed to an agent.
/// Labels: `agent`, `event_type`.
pub fn events_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("idds.events.dispatched")
        .with_description("Events dispatched to handlers")
        .build()
}

/// Counter: handler outcomes.
/// Labels: `agent`, `event_type`, `result` ("processed" | "requeued" | "failed").
pub fn events_completed() -> Counter<u64> {
    meter()
        .u64_counter("idds.events.completed")
        .with_description("Events whose handler returned")
        .build()
}

/// Counter: entity status changes.
/// Labels: `entity`, `from`, `to`.
pub fn state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("idds.entity.state_transitions")
        .with_description("Request, transform and processing status changes")
        .build()
}

/// Counter: switches between the primary backend and the local fallback.
/// Labels: `backend`, `direction` ("to_fallback" | "to_primary").
pub fn eventbus_failover() -> Counter<u64> {
    meter()
        .u64_counter("idds.eventbus.failover")
        .with_description("Event bus failovers and recoveries")
        .build()
}

/// Histogram: handler run time in milliseconds.
/// Labels: `agent`, `event_type`.
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("idds.handler.duration_ms")
        .with_description("Event handler duration in milliseconds")
        .with_unit("ms")
        .build()
}
