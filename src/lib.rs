//! # idds-rs
//!
//! Event-driven dispatch core for request orchestration.
//!
//! Requests are split into transforms and processings that agents drive
//! to completion through a pluggable event bus (in memory, Postgres, or a
//! ZeroMQ coordinator), claiming rows with `FOR UPDATE SKIP LOCKED` so that
//! each entity has at most one active handler across processes.

pub mod agent;
pub mod config;
pub mod db;
pub mod error;
pub mod eventbus;
pub mod model;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod workload;
