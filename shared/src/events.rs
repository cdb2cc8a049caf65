//! Event data model shared by every coordination component
//!
//! An [`Event`] is an immutable record of a type, an optional instance id and
//! an ordered payload. Components publish them onto the event bus and
//! scenario code waits on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered event payload
pub type Payload = serde_json::Map<String, Value>;

/// Well-known event types published by the harness components
pub mod event_types {
    pub const INSTANCE_READY: &str = "instance-ready";
    pub const SSH_READY: &str = "ssh-ready";
    pub const HTTP_READY: &str = "http-ready";
    pub const MONITOR_HEARTBEAT: &str = "monitor-heartbeat";
    pub const MONITOR_SHUTDOWN: &str = "monitor-shutdown";
    pub const MONITOR_ERROR: &str = "monitor-error";
    pub const MUTAGEN_STATUS: &str = "mutagen-status";
}

/// Structured event payload delivered through the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    event_type: String,
    instance_id: Option<String>,
    data: Payload,
    published_at: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, instance_id: Option<String>, data: Payload) -> Self {
        Self {
            event_type: event_type.into(),
            instance_id,
            data,
            published_at: Utc::now(),
        }
    }

    /// Event scoped to a single instance
    pub fn for_instance(event_type: impl Into<String>, instance_id: impl Into<String>, data: Payload) -> Self {
        Self::new(event_type, Some(instance_id.into()), data)
    }

    /// Event that is not tied to any instance
    pub fn global(event_type: impl Into<String>, data: Payload) -> Self {
        Self::new(event_type, None, data)
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    /// Look up a single payload field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Whether this event satisfies a `(type, instance)` wait filter.
    /// A `None` instance filter matches events for any instance.
    pub fn matches(&self, event_type: &str, instance_id: Option<&str>) -> bool {
        self.event_type == event_type && instance_id.is_none_or(|wanted| self.instance_id() == Some(wanted))
    }
}

/// Build a payload from key/value pairs, keeping insertion order
pub fn payload<K, I>(entries: I) -> Payload
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    entries.into_iter().map(|(key, value)| (key.into(), value)).collect()
}
