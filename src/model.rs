//! Core data model.
//!
//! Requests are split into transforms, each transform drives one
//! processing at a time, and a processing tracks one workload in an
//! external system. Agents move these entities through their statuses in
//! response to events.

pub mod entity;
pub mod event;
pub mod status;

pub use entity::*;
pub use event::{Event, EventPriority, EventStatus, EventType, merge_content};
pub use status::*;
