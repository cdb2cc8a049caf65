//! Event Bus
//!
//! Typed, optionally instance-scoped publish/subscribe with blocking waits.
//! Every published event is buffered per type until exactly one waiter
//! claims it; waits are FIFO per `(type, instance)` filter.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shared::{Event, Payload};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Number of recent events retained for timeout diagnostics
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

const RECENT_EVENTS_IN_ERROR: usize = 5;

/// Callback invoked synchronously for every matching published event
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("Timed out after {timeout:?} waiting for event '{event_type}'{}", instance_suffix(.instance_id))]
    Timeout {
        event_type: String,
        instance_id: Option<String>,
        timeout: Duration,
        queue_depth: usize,
        recent_events: Vec<Event>,
    },
}

fn instance_suffix(instance_id: &Option<String>) -> String {
    instance_id
        .as_ref()
        .map(|id| format!(" for '{id}'"))
        .unwrap_or_default()
}

/// Aggregated diagnostics for one event channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelMetrics {
    pub published_count: u64,
    pub consumed_count: u64,
    pub max_depth: usize,
    pub last_publish: Option<DateTime<Utc>>,
    pub last_consume: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Channel {
    pending: VecDeque<Event>,
    metrics: ChannelMetrics,
}

struct Subscriber {
    channel: Option<String>,
    callback: EventCallback,
}

#[derive(Default)]
struct BusState {
    channels: HashMap<String, Channel>,
    history: VecDeque<Event>,
    subscribers: BTreeMap<u64, Subscriber>,
    next_subscriber_id: u64,
}

/// Thread-safe event bus supporting typed channels and diagnostics
pub struct EventBus {
    state: Mutex<BusState>,
    notify: Notify,
    history_limit: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            notify: Notify::new(),
            history_limit,
        }
    }

    /// Publish an event to its channel. Never blocks on consumers.
    pub fn publish(&self, event: Event) {
        let (depth, callbacks) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let channel = state.channels.entry(event.event_type().to_string()).or_default();
            channel.pending.push_back(event.clone());
            let depth = channel.pending.len();
            channel.metrics.published_count += 1;
            channel.metrics.last_publish = Some(event.published_at());
            channel.metrics.max_depth = channel.metrics.max_depth.max(depth);

            state.history.push_back(event.clone());
            while state.history.len() > self.history_limit {
                state.history.pop_front();
            }

            let callbacks: Vec<EventCallback> = state
                .subscribers
                .values()
                .filter(|sub| sub.channel.as_deref().is_none_or(|name| name == event.event_type()))
                .map(|sub| sub.callback.clone())
                .collect();

            (depth, callbacks)
        };

        self.notify.notify_waiters();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                warn!(event_type = event.event_type(), "Event subscriber panicked");
            }
        }

        debug!(
            event_type = event.event_type(),
            instance_id = ?event.instance_id(),
            queue_depth = depth,
            "Event published"
        );
    }

    /// Wait for the oldest unclaimed event matching the filter and claim it.
    ///
    /// A `None` instance filter accepts events for any instance. Each event
    /// is handed to exactly one waiter.
    pub async fn wait_for(
        &self,
        event_type: &str,
        instance_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Event, EventBusError> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so a publish in between is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.try_take(event_type, instance_id) {
                return Ok(event);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self
                    .try_take(event_type, instance_id)
                    .ok_or_else(|| self.timeout_error(event_type, instance_id, timeout));
            }
        }
    }

    /// Claim a matching event without waiting
    pub fn try_take(&self, event_type: &str, instance_id: Option<&str>) -> Option<Event> {
        let mut state = self.state.lock();
        let channel = state.channels.get_mut(event_type)?;
        let index = channel
            .pending
            .iter()
            .position(|event| event.matches(event_type, instance_id))?;
        let event = channel.pending.remove(index)?;

        let now = Utc::now();
        channel.metrics.consumed_count += 1;
        channel.metrics.last_consume = Some(now);
        let latency_ms = (now - event.published_at()).num_milliseconds();

        debug!(
            event_type,
            instance_id = ?event.instance_id(),
            latency_ms,
            queue_depth = channel.pending.len(),
            "Event consumed"
        );
        Some(event)
    }

    /// Remove and return every unclaimed event, grouped by type
    pub fn drain_all(&self) -> BTreeMap<String, Vec<Event>> {
        let mut state = self.state.lock();
        let now = Utc::now();
        let mut drained = BTreeMap::new();

        for (name, channel) in state.channels.iter_mut() {
            if channel.pending.is_empty() {
                continue;
            }
            let events: Vec<Event> = channel.pending.drain(..).collect();
            channel.metrics.consumed_count += events.len() as u64;
            channel.metrics.last_consume = Some(now);
            drained.insert(name.clone(), events);
        }

        drained
    }

    /// Discard every unclaimed event
    pub fn drain(&self) {
        self.drain_all();
    }

    /// Number of unclaimed events for a type
    pub fn pending(&self, event_type: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(event_type)
            .map_or(0, |channel| channel.pending.len())
    }

    /// Most recent published events, oldest first
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn metrics_snapshot(&self) -> HashMap<String, ChannelMetrics> {
        self.state
            .lock()
            .channels
            .iter()
            .map(|(name, channel)| (name.clone(), channel.metrics.clone()))
            .collect()
    }

    /// Subscribe a callback to one channel, or to every channel when `channel` is `None`.
    ///
    /// Callbacks observe events without claiming them. The subscription is
    /// removed when the returned handle is dropped.
    pub fn subscribe<F>(self: &Arc<Self>, channel: Option<&str>, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.insert(
            id,
            Subscriber {
                channel: channel.map(str::to_string),
                callback: Arc::new(callback),
            },
        );

        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    /// Typed facade bound to a single event type
    pub fn channel(self: &Arc<Self>, name: &str) -> EventChannel {
        EventChannel {
            name: name.to_string(),
            bus: Arc::clone(self),
        }
    }

    fn timeout_error(&self, event_type: &str, instance_id: Option<&str>, timeout: Duration) -> EventBusError {
        let queue_depth = self.pending(event_type);
        EventBusError::Timeout {
            event_type: event_type.to_string(),
            instance_id: instance_id.map(str::to_string),
            timeout,
            queue_depth,
            recent_events: self.recent_events(RECENT_EVENTS_IN_ERROR),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle that removes its subscriber on drop
pub struct Subscription {
    bus: Weak<EventBus>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.state.lock().subscribers.remove(&self.id);
        }
    }
}

/// Event bus operations bound to a single event type
#[derive(Clone)]
pub struct EventChannel {
    name: String,
    bus: Arc<EventBus>,
}

impl EventChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publish(&self, instance_id: Option<&str>, data: Payload) -> Event {
        let event = Event::new(self.name.clone(), instance_id.map(str::to_string), data);
        self.bus.publish(event.clone());
        event
    }

    pub async fn wait_for(&self, instance_id: Option<&str>, timeout: Duration) -> Result<Event, EventBusError> {
        self.bus.wait_for(&self.name, instance_id, timeout).await
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.bus.subscribe(Some(&self.name), callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::payload;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SHORT: Duration = Duration::from_millis(50);

    fn ready(instance_id: &str, seq: u64) -> Event {
        Event::for_instance("ssh-ready", instance_id, payload([("seq", json!(seq))]))
    }

    #[tokio::test]
    async fn test_publish_then_wait_returns_event_once() {
        let bus = EventBus::new();
        bus.publish(ready("i-1", 1));

        let event = bus.wait_for("ssh-ready", Some("i-1"), SHORT).await.unwrap();
        assert_eq!(event.get("seq"), Some(&json!(1)));

        let second = bus.wait_for("ssh-ready", Some("i-1"), SHORT).await;
        assert!(matches!(second, Err(EventBusError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_events_delivered_in_publish_order() {
        let bus = EventBus::new();
        for seq in 0..5 {
            bus.publish(ready("i-1", seq));
        }

        for expected in 0..5 {
            let event = bus.wait_for("ssh-ready", None, SHORT).await.unwrap();
            assert_eq!(event.get("seq"), Some(&json!(expected)));
        }
    }

    #[tokio::test]
    async fn test_instance_filter_skips_other_instances() {
        let bus = EventBus::new();
        bus.publish(ready("i-2", 1));
        bus.publish(ready("i-1", 2));

        let event = bus.wait_for("ssh-ready", Some("i-1"), SHORT).await.unwrap();
        assert_eq!(event.instance_id(), Some("i-1"));

        // The other instance's event stays available
        assert_eq!(bus.pending("ssh-ready"), 1);
        let other = bus.wait_for("ssh-ready", Some("i-2"), SHORT).await.unwrap();
        assert_eq!(other.instance_id(), Some("i-2"));
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_later_publish() {
        let bus = Arc::new(EventBus::new());
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.wait_for("http-ready", Some("i-1"), Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(Event::for_instance("http-ready", "i-1", Payload::new()));

        let event = waiter.await.unwrap().unwrap();
        assert_eq!(event.event_type(), "http-ready");
    }

    #[tokio::test]
    async fn test_concurrent_waiters_never_share_an_event() {
        let bus = Arc::new(EventBus::new());
        let mut waiters = Vec::new();
        for _ in 0..8 {
            let bus = bus.clone();
            waiters.push(tokio::spawn(async move {
                bus.wait_for("ssh-ready", None, Duration::from_secs(2)).await
            }));
        }

        for seq in 0..8 {
            bus.publish(ready("i-1", seq));
        }

        let mut seen = Vec::new();
        for waiter in waiters {
            let event = waiter.await.unwrap().unwrap();
            seen.push(event.get("seq").and_then(|v| v.as_u64()).unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_timeout_error_carries_diagnostics() {
        let bus = EventBus::new();
        bus.publish(ready("i-2", 7));

        let err = bus.wait_for("ssh-ready", Some("i-1"), SHORT).await.unwrap_err();
        let EventBusError::Timeout {
            event_type,
            instance_id,
            queue_depth,
            recent_events,
            ..
        } = &err;
        assert_eq!(event_type, "ssh-ready");
        assert_eq!(instance_id.as_deref(), Some("i-1"));
        assert_eq!(*queue_depth, 1);
        assert_eq!(recent_events.len(), 1);
        assert!(err.to_string().contains("for 'i-1'"));
    }

    #[tokio::test]
    async fn test_drain_all_returns_only_unclaimed_events() {
        let bus = EventBus::new();
        bus.publish(ready("i-1", 1));
        bus.publish(ready("i-1", 2));
        bus.publish(Event::global("monitor-heartbeat", Payload::new()));

        bus.wait_for("ssh-ready", None, SHORT).await.unwrap();
        let drained = bus.drain_all();

        assert_eq!(drained["ssh-ready"].len(), 1);
        assert_eq!(drained["monitor-heartbeat"].len(), 1);
        assert!(bus.drain_all().is_empty());
    }

    #[test]
    fn test_metrics_track_publish_and_consume() {
        let bus = EventBus::new();
        bus.publish(ready("i-1", 1));
        bus.publish(ready("i-1", 2));
        bus.try_take("ssh-ready", None).unwrap();

        let metrics = bus.metrics_snapshot();
        let channel = &metrics["ssh-ready"];
        assert_eq!(channel.published_count, 2);
        assert_eq!(channel.consumed_count, 1);
        assert_eq!(channel.max_depth, 2);
        assert!(channel.last_consume.is_some());
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = EventBus::with_history_limit(3);
        for seq in 0..10 {
            bus.publish(ready("i-1", seq));
        }

        let recent = bus.recent_events(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].get("seq"), Some(&json!(7)));
    }

    #[test]
    fn test_subscription_sees_events_until_dropped() {
        let bus = Arc::new(EventBus::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let subscription = {
            let hits = hits.clone();
            bus.subscribe(Some("ssh-ready"), move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        bus.publish(ready("i-1", 1));
        bus.publish(Event::global("monitor-heartbeat", Payload::new()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(subscription);
        bus.publish(ready("i-1", 2));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Observing does not claim
        assert_eq!(bus.pending("ssh-ready"), 2);
    }

    #[test]
    fn test_panicking_subscriber_is_contained() {
        let bus = Arc::new(EventBus::new());
        let _subscription = bus.subscribe(None, |_| panic!("subscriber bug"));

        bus.publish(ready("i-1", 1));
        assert_eq!(bus.pending("ssh-ready"), 1);
    }

    #[tokio::test]
    async fn test_channel_facade_round_trip() {
        let bus = Arc::new(EventBus::new());
        let channel = bus.channel("instance-ready");

        channel.publish(Some("i-3"), payload([("state", json!("running"))]));
        let event = channel.wait_for(Some("i-3"), SHORT).await.unwrap();

        assert_eq!(channel.name(), "instance-ready");
        assert_eq!(event.get("state"), Some(&json!("running")));
    }
}
