//! TOML settings for the event bus, the agents and the workload client.
//!
//! ```toml
//! [eventbus]
//! backend = "broker"
//! coordinator_addr = "tcp://idds-coordinator:5556"
//!
//! [clerk]
//! max_number_workers = 16
//! ```

use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub eventbus: EventBusConfig,
    pub clerk: AgentConfig,
    pub transformer: AgentConfig,
    pub carrier: AgentConfig,
    pub workload: WorkloadConfig,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read settings {}: {e}", path.display())))?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad settings {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Plain FIFO, in process.
    Memory,
    /// Merging, staleness-ordered queue, in process.
    Coalescing,
    /// The `events` table.
    Database,
    /// A remote coordinator over ZeroMQ.
    Broker,
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "memory" => Ok(BackendKind::Memory),
            "coalescing" => Ok(BackendKind::Coalescing),
            "database" => Ok(BackendKind::Database),
            "broker" => Ok(BackendKind::Broker),
            other => Err(Error::Config(format!("unknown event bus backend: {other}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub backend: BackendKind,
    /// Queued events older than this are never overtaken by staler ones.
    pub max_delay_secs: u64,
    /// How often dispatch history is pruned.
    pub clean_interval_secs: u64,
    /// Keep processed and failed rows in `events_archive`.
    pub to_archive: bool,
    /// Upper bound on how long `get` waits for an event.
    pub get_wait_secs: u64,
    /// Events left in `processing` longer than this are handed out again.
    pub processing_lease_secs: u64,
    pub coordinator_addr: String,
    pub bind_addr: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub socket_timeout_secs: u64,
    pub failure_threshold: u32,
    pub timeout_threshold: u32,
    pub failure_timeout_secs: u64,
    pub max_recoveries: u32,
    pub health_check_interval_secs: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Coalescing,
            max_delay_secs: 180,
            clean_interval_secs: 4 * 3600,
            to_archive: true,
            get_wait_secs: 10,
            processing_lease_secs: 3600,
            coordinator_addr: "tcp://127.0.0.1:5556".to_string(),
            bind_addr: "tcp://0.0.0.0:5556".to_string(),
            username: None,
            password: None,
            socket_timeout_secs: 10,
            failure_threshold: 5,
            timeout_threshold: 5,
            failure_timeout_secs: 180,
            max_recoveries: 10,
            health_check_interval_secs: 60,
        }
    }
}

impl EventBusConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.clean_interval_secs)
    }

    pub fn get_wait(&self) -> Duration {
        Duration::from_secs(self.get_wait_secs)
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Size of the handler pool.
    pub max_number_workers: usize,
    /// Base period of the pollers.
    pub poll_period_secs: u64,
    pub new_poll_period_secs: i64,
    pub update_poll_period_secs: i64,
    pub poll_period_increase_rate: i64,
    pub max_new_poll_period_secs: i64,
    pub max_update_poll_period_secs: i64,
    /// 0 means unlimited.
    pub max_new_retries: i32,
    /// 0 means unlimited.
    pub max_update_retries: i32,
    pub retrieve_bulk_size: i64,
    /// Period of the command poller.
    pub poll_operation_period_secs: u64,
    pub heartbeat_delay_secs: u64,
    /// Pause between event fetches.
    pub event_interval_delay_ms: u64,
    /// Handlers running longer than this are reported as hung.
    pub max_worker_exec_time_secs: u64,
    /// Locks older than this are considered abandoned and released.
    pub lock_lease_secs: i64,
    /// Consecutive terminal observations needed before a processing is
    /// reported terminal.
    pub terminal_confirmations: i32,
    /// An event bounced off a locked row this many times is dropped; the
    /// pollers will produce a fresh one.
    pub max_event_requeues: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_number_workers: 8,
            poll_period_secs: 10,
            new_poll_period_secs: 10,
            update_poll_period_secs: 10,
            poll_period_increase_rate: 2,
            max_new_poll_period_secs: 6 * 3600,
            max_update_poll_period_secs: 6 * 3600,
            max_new_retries: 3,
            max_update_retries: 0,
            retrieve_bulk_size: 10,
            poll_operation_period_secs: 120,
            heartbeat_delay_secs: 600,
            event_interval_delay_ms: 100,
            max_worker_exec_time_secs: 3600,
            lock_lease_secs: 3600,
            terminal_confirmations: 3,
            max_event_requeues: 10,
        }
    }
}

impl AgentConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_period_secs)
    }

    pub fn poll_operation_period(&self) -> Duration {
        Duration::from_secs(self.poll_operation_period_secs)
    }

    pub fn heartbeat_delay(&self) -> Duration {
        Duration::from_secs(self.heartbeat_delay_secs)
    }

    pub fn event_interval_delay(&self) -> Duration {
        Duration::from_millis(self.event_interval_delay_ms)
    }

    pub fn max_worker_exec_time(&self) -> Duration {
        Duration::from_secs(self.max_worker_exec_time_secs)
    }
}

// ---------------------------------------------------------------------------
// Workload system
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub token: Option<SecretString>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            base_url: "https://pandaserver.cern.ch:25443/server/panda".to_string(),
            timeout_secs: 60,
            token: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings.eventbus.backend, BackendKind::Coalescing);
        assert_eq!(settings.eventbus.max_delay_secs, 180);
        assert_eq!(settings.clerk.max_number_workers, 8);
        assert_eq!(settings.carrier.terminal_confirmations, 3);
    }

    #[test]
    fn sections_override_individually() {
        let settings = Settings::parse(
            r#"
            [eventbus]
            backend = "broker"
            failure_timeout_secs = 30

            [transformer]
            max_number_workers = 2
            "#,
        )
        .unwrap();
        assert_eq!(settings.eventbus.backend, BackendKind::Broker);
        assert_eq!(settings.eventbus.failure_timeout_secs, 30);
        assert_eq!(settings.eventbus.socket_timeout_secs, 10);
        assert_eq!(settings.transformer.max_number_workers, 2);
        assert_eq!(settings.clerk.max_number_workers, 8);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(Settings::parse("[eventbus]\nbackend = \"kafka\"").is_err());
        assert!("kafka".parse::<BackendKind>().is_err());
    }
}
