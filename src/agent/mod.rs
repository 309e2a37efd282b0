//! Agents: pollers that turn due entities into events, and handlers that
//! move each entity to its next status.
//!
//! Every agent runs inside an [`AgentRuntime`], which owns the timer loop,
//! the event dispatch loop and the bounded handler pool. The three agents
//! form a chain: the [`Clerk`] turns requests into transforms, the
//! [`Transformer`] turns transforms into processings, and the [`Carrier`]
//! submits processings to the workload system and tracks them.

pub mod carrier;
pub mod clerk;
pub mod context;
pub mod debounce;
pub mod retry;
pub mod runtime;
pub mod timer;
pub mod transformer;

pub use carrier::Carrier;
pub use clerk::Clerk;
pub use context::AgentContext;
pub use debounce::TerminalDebounce;
pub use retry::RetryPolicy;
pub use runtime::AgentRuntime;
pub use timer::TimerSpec;
pub use transformer::Transformer;

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::eventbus::EventBus;
use crate::model::{Event, EventType, PollState};
use crate::store::Store;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Agent: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn deps(&self) -> &AgentDeps;

    /// Event types this agent consumes.
    fn event_types(&self) -> &'static [EventType];

    fn timers(&self) -> Vec<TimerSpec>;

    /// Run the timer task called `name`.
    async fn run_timer(&self, name: &'static str) -> Result<()>;

    /// Handle one event. [`crate::error::Error::Locked`] means the entity
    /// was busy and the event should be retried later.
    async fn handle_event(&self, event: &Event) -> Result<()>;
}

/// What every agent is built from.
#[derive(Clone)]
pub struct AgentDeps {
    /// Short random id, used as the publisher of this agent's events.
    pub id: String,
    pub config: AgentConfig,
    pub bus: Arc<EventBus>,
    pub store: Arc<dyn Store>,
    pub context: Arc<AgentContext>,
}

impl AgentDeps {
    pub fn new(
        config: AgentConfig,
        bus: Arc<EventBus>,
        store: Arc<dyn Store>,
        context: Arc<AgentContext>,
    ) -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self {
            id,
            config,
            bus,
            store,
            context,
        }
    }

    /// Poll state for entities this agent creates.
    pub fn poll_state(&self) -> PollState {
        PollState {
            new_poll_period_secs: self.config.new_poll_period_secs,
            update_poll_period_secs: self.config.update_poll_period_secs,
            ..PollState::new(self.config.max_new_retries, self.config.max_update_retries, 0)
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config)
    }

    pub fn event(&self, event_type: EventType, subject: i64) -> Event {
        Event::about(event_type, subject).publisher(self.id.clone())
    }

    /// Publish one event per subject.
    pub async fn publish(&self, event_type: EventType, subjects: &[i64]) -> Result<()> {
        if subjects.is_empty() {
            return Ok(());
        }
        let events = subjects
            .iter()
            .map(|&subject| self.event(event_type, subject))
            .collect();
        self.send_all(events).await
    }

    pub async fn send_all(&self, events: Vec<Event>) -> Result<()> {
        self.bus.send_bulk(events).await
    }
}

/// The entity id an event is about.
pub(crate) fn subject(event: &Event) -> Result<i64> {
    event
        .subject
        .ok_or_else(|| Error::Other(format!("{} event without a subject", event.event_type)))
}
