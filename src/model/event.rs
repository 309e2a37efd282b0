//! Events: the unit of work carried by the event bus.
//!
//! An event names an entity (`subject`) and what happened to it
//! (`event_type`). Two pending events about the same entity coalesce into
//! one, summing their counters and merging their content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

macro_rules! event_types {
    ($($variant:ident = $code:literal => $text:literal),+ $(,)?) => {
        /// What happened. The numeric code is stable across releases.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum EventType {
            $($variant),+
        }

        impl EventType {
            pub const ALL: &'static [EventType] = &[$(EventType::$variant),+];

            pub fn code(self) -> i32 {
                match self {
                    $(EventType::$variant => $code),+
                }
            }

            pub fn from_code(code: i32) -> Option<Self> {
                match code {
                    $($code => Some(EventType::$variant),)+
                    _ => None,
                }
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $(EventType::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for EventType {
            type Err = crate::error::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(EventType::$variant),)+
                    other => Err(crate::error::Error::Other(format!("unknown event type: {other}"))),
                }
            }
        }
    };
}

event_types! {
    Event = 0 => "event",
    StateClaim = 1 => "state_claim",
    Demand = 2 => "demand",
    Message = 3 => "message",
    NewRequest = 10 => "new_request",
    UpdateRequest = 11 => "update_request",
    AbortRequest = 12 => "abort_request",
    ResumeRequest = 13 => "resume_request",
    ExpireRequest = 14 => "expire_request",
    CloseRequest = 15 => "close_request",
    NewTransform = 20 => "new_transform",
    UpdateTransform = 21 => "update_transform",
    AbortTransform = 22 => "abort_transform",
    ResumeTransform = 23 => "resume_transform",
    NewProcessing = 30 => "new_processing",
    UpdateProcessing = 31 => "update_processing",
    AbortProcessing = 32 => "abort_processing",
    ResumeProcessing = 33 => "resume_processing",
    SyncProcessing = 34 => "sync_processing",
    TerminatedProcessing = 35 => "terminated_processing",
    TriggerProcessing = 36 => "trigger_processing",
    MsgTriggerProcessing = 37 => "msg_trigger_processing",
    UpdateCommand = 40 => "update_command",
    Test = 90 => "test",
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    New,
    Processing,
    Processed,
    Failed,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventStatus::New => "new",
            EventStatus::Processing => "processing",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    Low = 0,
    Medium = 10,
    High = 50,
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An event on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: EventType,
    /// Agent that published the event.
    #[serde(default)]
    pub publisher_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// How many logical events this one stands for after merging.
    #[serde(default = "one")]
    pub counter: u32,
    /// Opaque payload. Only the flags below are interpreted by the bus.
    #[serde(default)]
    pub content: Option<Value>,
    /// Id of the request, transform or processing the event is about.
    #[serde(default)]
    pub subject: Option<i64>,
    #[serde(default)]
    pub requeue_counter: u32,
}

fn one() -> u32 {
    1
}

const TERMINATING: &str = "is_terminating";
const HAS_UPDATES: &str = "has_updates";
const COMMAND_IDS: &str = "cmd_ids";

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            publisher_id: None,
            timestamp: Utc::now(),
            counter: 1,
            content: None,
            subject: None,
            requeue_counter: 0,
        }
    }

    /// An event about one entity.
    pub fn about(event_type: EventType, subject: i64) -> Self {
        Self {
            subject: Some(subject),
            ..Self::new(event_type)
        }
    }

    pub fn publisher(mut self, publisher_id: impl Into<String>) -> Self {
        self.publisher_id = Some(publisher_id.into());
        self
    }

    pub fn content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    /// The id events are coalesced on: the subject when there is one,
    /// otherwise a value derived from the event's own uuid.
    pub fn actual_id(&self) -> i64 {
        match self.subject {
            Some(id) => id,
            None => (self.id.as_u128() % 1_000_000) as i64,
        }
    }

    pub fn logical_key(&self) -> (EventType, i64) {
        (self.event_type, self.actual_id())
    }

    pub fn able_to_merge(&self, other: &Event) -> bool {
        self.event_type == other.event_type && self.actual_id() == other.actual_id()
    }

    /// Fold `other` into this event and report whether it was folded in.
    ///
    /// A folded event always changes, since its counter grows, even when
    /// the content brings nothing new. Returns `false` and leaves `self`
    /// untouched when the two events are about different things.
    pub fn merge(&mut self, other: Event) -> bool {
        if !self.able_to_merge(&other) {
            return false;
        }
        self.counter = self.counter.saturating_add(other.counter);
        self.requeue_counter = self.requeue_counter.max(other.requeue_counter);
        if self.publisher_id.is_none() {
            self.publisher_id = other.publisher_id;
        }
        if let Some(new) = other.content {
            match self.content.as_mut() {
                Some(current) => {
                    merge_content(current, new);
                }
                None => self.content = Some(new),
            }
        }
        true
    }

    pub fn requeue(&mut self) {
        self.requeue_counter += 1;
    }

    pub fn set_terminating(&mut self) {
        self.set_flag(TERMINATING);
    }

    pub fn is_terminating(&self) -> bool {
        self.flag(TERMINATING)
    }

    pub fn set_has_updates(&mut self) {
        self.set_flag(HAS_UPDATES);
    }

    pub fn has_updates(&self) -> bool {
        self.flag(HAS_UPDATES)
    }

    /// Commands that triggered this event. Kept as a list so that merged
    /// events keep every id.
    pub fn command_ids(&self) -> Vec<i64> {
        self.content
            .as_ref()
            .and_then(|c| c.get(COMMAND_IDS))
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default()
    }

    pub fn with_command(self, command_id: i64) -> Self {
        let mut event = self;
        let mut ids = event.command_ids();
        ids.push(command_id);
        event.insert_content(COMMAND_IDS, Value::from(ids));
        event
    }

    fn flag(&self, key: &str) -> bool {
        self.content
            .as_ref()
            .and_then(|c| c.get(key))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn set_flag(&mut self, key: &str) {
        self.insert_content(key, Value::Bool(true));
    }

    fn insert_content(&mut self, key: &str, value: Value) {
        let mut map = match self.content.take() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.insert(key.to_string(), value);
        self.content = Some(Value::Object(map));
    }
}

// ---------------------------------------------------------------------------
// Content merge
// ---------------------------------------------------------------------------

/// Merge `new` into `current` with union semantics.
///
/// Objects merge key by key, booleans OR, numbers add, strings and arrays
/// concatenate. `null` never overwrites a value, equal values are left
/// alone, and on a type mismatch the newer value wins. Returns whether
/// `current` changed.
pub fn merge_content(current: &mut Value, new: Value) -> bool {
    if new.is_null() || *current == new {
        return false;
    }
    if current.is_null() {
        *current = new;
        return true;
    }
    match (current, new) {
        (Value::Object(cur), Value::Object(new)) => {
            let mut changed = false;
            for (key, value) in new {
                match cur.get_mut(&key) {
                    Some(existing) => changed |= merge_content(existing, value),
                    None if value.is_null() => {}
                    None => {
                        cur.insert(key, value);
                        changed = true;
                    }
                }
            }
            changed
        }
        (Value::Bool(cur), Value::Bool(new)) => {
            let merged = *cur || new;
            let changed = merged != *cur;
            *cur = merged;
            changed
        }
        (Value::Number(cur), Value::Number(new)) => {
            let sum = match (cur.as_i64(), new.as_i64()) {
                (Some(a), Some(b)) => Value::from(a.saturating_add(b)),
                _ => Value::from(cur.as_f64().unwrap_or(0.0) + new.as_f64().unwrap_or(0.0)),
            };
            if let Value::Number(n) = sum {
                *cur = n;
            }
            true
        }
        (Value::String(cur), Value::String(new)) => {
            cur.push_str(&new);
            true
        }
        (Value::Array(cur), Value::Array(new)) => {
            let changed = !new.is_empty();
            cur.extend(new);
            changed
        }
        (current, new) => {
            *current = new;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_sums_counters_and_unions_content() {
        let mut a = Event::about(EventType::UpdateRequest, 7).content(json!({
            "has_updates": false,
            "files": ["a"],
            "n": 1,
            "nested": {"x": 1}
        }));
        let b = Event::about(EventType::UpdateRequest, 7).content(json!({
            "has_updates": true,
            "files": ["b"],
            "n": 2,
            "nested": {"y": 2},
            "skip": null
        }));

        assert!(a.merge(b));
        assert_eq!(a.counter, 2);
        assert_eq!(
            a.content,
            Some(json!({
                "has_updates": true,
                "files": ["a", "b"],
                "n": 3,
                "nested": {"x": 1, "y": 2}
            }))
        );
    }

    #[test]
    fn merge_never_drops_a_set_flag() {
        let mut a = Event::about(EventType::UpdateTransform, 1);
        a.set_has_updates();
        let mut b = Event::about(EventType::UpdateTransform, 1)
            .content(json!({"has_updates": false}));
        b.set_terminating();

        a.merge(b);
        assert!(a.has_updates());
        assert!(a.is_terminating());
    }

    #[test]
    fn merge_with_nothing_new_still_counts() {
        let mut a = Event::about(EventType::UpdateProcessing, 4).content(json!({"k": "v"}));
        let b = Event::about(EventType::UpdateProcessing, 4).content(json!({"k": "v"}));
        assert!(a.merge(b));
        assert_eq!(a.counter, 2);
        assert_eq!(a.content, Some(json!({"k": "v"})));
    }

    #[test]
    fn merge_refuses_different_keys() {
        let mut a = Event::about(EventType::UpdateRequest, 1);
        let b = Event::about(EventType::UpdateRequest, 2);
        let c = Event::about(EventType::NewRequest, 1);
        assert!(!a.merge(b));
        assert!(!a.merge(c));
        assert_eq!(a.counter, 1);
    }

    #[test]
    fn generic_events_key_on_their_uuid() {
        let e = Event::new(EventType::Test);
        assert!(e.actual_id() < 1_000_000);
        assert_eq!(e.logical_key(), (EventType::Test, e.actual_id()));
    }

    #[test]
    fn serde_round_trip_preserves_fields() {
        let mut e = Event::about(EventType::AbortRequest, 42)
            .publisher("clerk-0a1b2c3d")
            .with_command(9);
        e.counter = 3;
        let encoded = serde_json::to_string(&e).unwrap();
        let decoded: Event = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, e);
        assert_eq!(decoded.command_ids(), vec![9]);
    }

    #[test]
    fn merged_commands_keep_every_id() {
        let mut a = Event::about(EventType::AbortRequest, 5).with_command(3);
        let b = Event::about(EventType::AbortRequest, 5).with_command(4);
        assert!(a.merge(b));
        assert_eq!(a.command_ids(), vec![3, 4]);
    }

    #[test]
    fn event_type_codes_are_stable() {
        assert_eq!(EventType::NewRequest.code(), 10);
        assert_eq!(EventType::MsgTriggerProcessing.code(), 37);
        assert_eq!(EventType::from_code(90), Some(EventType::Test));
        assert_eq!("update_command".parse::<EventType>().unwrap(), EventType::UpdateCommand);
    }
}
