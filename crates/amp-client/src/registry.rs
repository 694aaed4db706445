//! Topic subscriptions and their merged state.
//!
//! The registry owns one [`Subscription`] per topic: its resume cursor, its
//! handlers and the snapshot built from `full`/`diff` publishes. It never
//! invokes handlers itself; every mutation that should notify returns a
//! [`Delivery`] that the caller dispatches after releasing its lock, so a
//! handler can subscribe or unsubscribe without deadlocking.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use amp_core::{Message, Snapshot, Subscriptions, UpdateType, merge_into};
use amp_logging::DiagnosticSink;
use indexmap::IndexMap;
use serde_json::{Value, json};
use tracing::{debug, error, warn};

/// Callback registered for a topic.
pub type TopicHandler = Arc<dyn Fn(&TopicEvent) + Send + Sync>;

/// Called with a fresh `subscribe` message whenever the topic set changes.
pub type ChangeObserver = Box<dyn Fn(Message) + Send + Sync>;

/// Identifies a registered handler for removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// What a topic handler is told.
#[derive(Clone, Debug)]
pub enum TopicEvent {
    /// The topic's state: after a `full` or `diff`, or as a replay when a
    /// handler joins an existing topic (`update_type` is then `None`).
    State {
        /// Topic key.
        topic: String,
        /// Cursor after the update.
        ts: i64,
        /// Update that produced this state.
        update_type: Option<UpdateType>,
        /// Merged state; `None` until the first `full` or `diff`.
        snapshot: Option<Arc<Snapshot>>,
        /// Raw diff body for `diff` updates.
        diff: Option<Value>,
    },
    /// A pass-through update that does not touch the snapshot.
    Notification {
        /// Topic key.
        topic: String,
        /// Cursor after the update.
        ts: i64,
        /// `append`, `update`, `event`, `burstStart` or `burstEnd`.
        update_type: UpdateType,
        /// Update body.
        body: Option<Value>,
    },
    /// The server closed the topic; the subscription is gone.
    Closed {
        /// Topic key.
        topic: String,
        /// Cursor of the close update.
        ts: i64,
    },
}

impl TopicEvent {
    /// Topic the event concerns.
    pub fn topic(&self) -> &str {
        match self {
            Self::State { topic, .. } | Self::Notification { topic, .. } | Self::Closed { topic, .. } => {
                topic
            }
        }
    }
}

/// One subscribed topic.
pub struct Subscription {
    key: String,
    ts: i64,
    handlers: Vec<(HandlerId, TopicHandler)>,
    snapshot: Option<Arc<Snapshot>>,
}

impl Subscription {
    fn new(key: String) -> Self {
        Self {
            key,
            ts: 0,
            handlers: Vec::new(),
            snapshot: None,
        }
    }

    /// Topic key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Last applied update timestamp.
    pub fn ts(&self) -> i64 {
        self.ts
    }

    /// Current merged state.
    pub fn snapshot(&self) -> Option<&Arc<Snapshot>> {
        self.snapshot.as_ref()
    }

    fn handlers(&self) -> Vec<TopicHandler> {
        self.handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
    }
}

/// Handlers to notify, snapshotted at the time of the update.
#[must_use = "a delivery does nothing until dispatched"]
pub struct Delivery {
    handlers: Vec<TopicHandler>,
    event: TopicEvent,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("handlers", &self.handlers.len())
            .field("event", &self.event)
            .finish()
    }
}

impl Delivery {
    /// The event being delivered.
    pub fn event(&self) -> &TopicEvent {
        &self.event
    }

    /// Invoke every handler in registration order. A panicking handler is
    /// reported and the remaining handlers still run. Returns how many
    /// handlers completed normally.
    pub fn dispatch(self, sink: &dyn DiagnosticSink) -> usize {
        let mut completed = 0;
        for handler in &self.handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&self.event))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(topic = %self.event.topic(), error = %message, "topic handler panicked");
                    sink.error(&json!({
                        "name": "handlerPanic",
                        "topic": self.event.topic(),
                        "message": message,
                    }));
                }
            }
        }
        completed
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Result of applying a `publish`.
#[must_use]
#[derive(Debug)]
pub enum PublishOutcome {
    /// Applied; the delivery notifies the topic's handlers.
    Delivered(Delivery),
    /// No subscription for the topic; dropped.
    TopicNotFound,
    /// Unrecognized update type; dropped.
    UnknownUpdateType(u8),
}

/// Subscriptions keyed by topic, in subscription order.
pub struct SubscriptionRegistry {
    subscriptions: IndexMap<String, Subscription>,
    next_handler: u64,
    track_changes: bool,
    observer: Option<ChangeObserver>,
}

impl SubscriptionRegistry {
    /// Empty registry. `observer` is told whenever the topic set changes.
    pub fn new(track_changes: bool, observer: Option<ChangeObserver>) -> Self {
        Self {
            subscriptions: IndexMap::new(),
            next_handler: 0,
            track_changes,
            observer,
        }
    }

    /// Register `handler` for `topic`.
    ///
    /// A new topic notifies the change observer. Joining an existing topic
    /// sends nothing and returns a replay of the current state for the new
    /// handler alone.
    pub fn add(&mut self, topic: &str, handler: TopicHandler) -> (HandlerId, Option<Delivery>) {
        self.next_handler += 1;
        let id = HandlerId(self.next_handler);

        if let Some(subscription) = self.subscriptions.get_mut(topic) {
            subscription.handlers.push((id, Arc::clone(&handler)));
            let replay = Delivery {
                handlers: vec![handler],
                event: TopicEvent::State {
                    topic: topic.to_string(),
                    ts: subscription.ts,
                    update_type: None,
                    snapshot: subscription.snapshot.clone(),
                    diff: None,
                },
            };
            return (id, Some(replay));
        }

        let mut subscription = Subscription::new(topic.to_string());
        subscription.handlers.push((id, handler));
        let _ = self.subscriptions.insert(topic.to_string(), subscription);
        debug!(topic, "subscribed");
        self.notify_observer();
        (id, None)
    }

    /// Detach a handler. Dropping the last handler removes the topic and
    /// notifies the change observer.
    pub fn remove(&mut self, topic: &str, id: HandlerId) -> bool {
        let Some(subscription) = self.subscriptions.get_mut(topic) else {
            return false;
        };
        let before = subscription.handlers.len();
        subscription.handlers.retain(|(hid, _)| *hid != id);
        if subscription.handlers.len() == before {
            return false;
        }
        if subscription.handlers.is_empty() {
            let _ = self.subscriptions.shift_remove(topic);
            debug!(topic, "unsubscribed");
            self.notify_observer();
        }
        true
    }

    /// A `subscribe` message mapping every topic to its cursor.
    pub fn subscribe_message(&self) -> Message {
        let subscriptions: Subscriptions = self
            .subscriptions
            .values()
            .map(|s| (s.key.clone(), s.ts))
            .collect();
        Message::subscribe(subscriptions)
    }

    /// Apply a `publish` to its topic.
    pub fn apply_publish(&mut self, message: Message) -> PublishOutcome {
        let topic = message.topic().to_string();
        let update_type = message.update_type.unwrap_or_default();

        let Some(subscription) = self.subscriptions.get_mut(&topic) else {
            debug!(topic = %topic, "topic not found");
            return PublishOutcome::TopicNotFound;
        };

        let ts = message.ts.unwrap_or(subscription.ts);
        subscription.ts = ts;
        if let UpdateType::Other(code) = update_type {
            warn!(topic = %topic, code, "unknown update type, dropping publish");
            return PublishOutcome::UnknownUpdateType(code);
        }
        let handlers = subscription.handlers();

        let event = match update_type {
            UpdateType::Close => {
                let _ = self.subscriptions.shift_remove(&topic);
                debug!(topic = %topic, ts, "topic closed by server");
                TopicEvent::Closed { topic, ts }
            }
            UpdateType::Full => {
                let body = message.body.unwrap_or(Value::Null);
                let snapshot = Arc::new(Snapshot::from_value(body, self.track_changes));
                subscription.snapshot = Some(Arc::clone(&snapshot));
                TopicEvent::State {
                    topic,
                    ts,
                    update_type: Some(update_type),
                    snapshot: Some(snapshot),
                    diff: None,
                }
            }
            UpdateType::Diff => {
                let track_changes = self.track_changes;
                let snapshot = subscription
                    .snapshot
                    .get_or_insert_with(|| Arc::new(Snapshot::new(track_changes)));
                if let Some(body) = &message.body {
                    merge_into(Arc::make_mut(snapshot), body);
                }
                TopicEvent::State {
                    topic,
                    ts,
                    update_type: Some(update_type),
                    snapshot: Some(Arc::clone(snapshot)),
                    diff: message.body,
                }
            }
            pass_through => TopicEvent::Notification {
                topic,
                ts,
                update_type: pass_through,
                body: message.body,
            },
        };

        PublishOutcome::Delivered(Delivery { handlers, event })
    }

    /// Subscribed topics, in subscription order.
    pub fn topics(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    /// The subscription for `topic`.
    pub fn get(&self, topic: &str) -> Option<&Subscription> {
        self.subscriptions.get(topic)
    }

    /// Cursor of `topic`.
    pub fn ts(&self, topic: &str) -> Option<i64> {
        self.subscriptions.get(topic).map(|s| s.ts)
    }

    /// Current snapshot of `topic`.
    pub fn snapshot(&self, topic: &str) -> Option<Arc<Snapshot>> {
        self.subscriptions.get(topic).and_then(|s| s.snapshot.clone())
    }

    /// Number of subscribed topics.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether no topic is subscribed.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    fn notify_observer(&self) {
        if let Some(observer) = &self.observer {
            observer(self.subscribe_message());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use amp_logging::{RecordingSink, capture_logs};
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use tracing::Level;

    type Seen = Arc<Mutex<Vec<TopicEvent>>>;

    fn recorder() -> (TopicHandler, Seen) {
        let seen: Seen = Arc::default();
        let sink = Arc::clone(&seen);
        let handler: TopicHandler = Arc::new(move |event: &TopicEvent| sink.lock().push(event.clone()));
        (handler, seen)
    }

    fn observed() -> (SubscriptionRegistry, Arc<Mutex<Vec<Message>>>) {
        let sent: Arc<Mutex<Vec<Message>>> = Arc::default();
        let log = Arc::clone(&sent);
        let registry = SubscriptionRegistry::new(true, Some(Box::new(move |m: Message| log.lock().push(m))));
        (registry, sent)
    }

    fn deliver(outcome: PublishOutcome) {
        match outcome {
            PublishOutcome::Delivered(delivery) => {
                let _ = delivery.dispatch(&RecordingSink::default());
            }
            _ => panic!("expected delivery"),
        }
    }

    fn cursor(pairs: &[(&str, i64)]) -> Subscriptions {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    #[test]
    fn subscribe_message_lists_every_topic() {
        let (mut registry, _) = observed();
        let (h, _) = recorder();
        let _ = registry.add("t1", Arc::clone(&h));
        let _ = registry.add("t2", h);

        let message = registry.subscribe_message();
        assert_eq!(message.kind, amp_core::MessageType::Subscribe);
        assert_eq!(message.subscriptions, Some(cursor(&[("t1", 0), ("t2", 0)])));
    }

    #[test]
    fn new_topic_notifies_observer_existing_replays() {
        let (mut registry, sent) = observed();
        let (first, _) = recorder();
        let (second, seen) = recorder();

        let (_, replay) = registry.add("t1", first);
        assert!(replay.is_none());
        assert_eq!(sent.lock().len(), 1);

        deliver(registry.apply_publish(Message::publish("t1", 10, UpdateType::Full, Some(json!({"x": 1})))));

        let (_, replay) = registry.add("t1", second);
        assert_eq!(sent.lock().len(), 1);
        let dispatched = replay.expect("replay").dispatch(&RecordingSink::default());
        assert_eq!(dispatched, 1);

        let events = seen.lock();
        assert_matches!(
            &events[0],
            TopicEvent::State { ts: 10, update_type: None, snapshot: Some(s), .. }
                if s.to_value() == json!({"x": 1})
        );
    }

    #[test]
    fn full_then_diff_tracks_change() {
        let (mut registry, _) = observed();
        let (h, seen) = recorder();
        let _ = registry.add("t1", h);

        deliver(registry.apply_publish(Message::publish("t1", 10, UpdateType::Full, Some(json!({"x": 1})))));
        deliver(registry.apply_publish(Message::publish("t1", 20, UpdateType::Diff, Some(json!({"x": 2})))));

        assert_eq!(registry.ts("t1"), Some(20));
        let snapshot = registry.snapshot("t1").unwrap();
        assert_eq!(snapshot.to_value(), json!({"x": 2}));
        assert_eq!(snapshot.change(&["x"]).unwrap().previous, json!(1));

        let events = seen.lock();
        assert_eq!(events.len(), 2);
        assert_matches!(&events[1], TopicEvent::State { diff: Some(d), .. } if *d == json!({"x": 2}));
    }

    #[test]
    fn diff_without_snapshot_starts_empty() {
        let (mut registry, _) = observed();
        let (h, _) = recorder();
        let _ = registry.add("t1", h);
        deliver(registry.apply_publish(Message::publish("t1", 1, UpdateType::Diff, Some(json!({"a": {"b": 1}})))));
        assert_eq!(registry.snapshot("t1").unwrap().to_value(), json!({"a": {"b": 1}}));
    }

    #[test]
    fn untracked_registry_records_no_changes() {
        let mut registry = SubscriptionRegistry::new(false, None);
        let (h, _) = recorder();
        let _ = registry.add("t1", h);
        deliver(registry.apply_publish(Message::publish("t1", 1, UpdateType::Full, Some(json!({"x": 1})))));
        deliver(registry.apply_publish(Message::publish("t1", 2, UpdateType::Diff, Some(json!({"x": 2})))));
        assert!(registry.snapshot("t1").unwrap().change(&["x"]).is_none());
    }

    #[test]
    fn earlier_snapshot_is_not_mutated_by_diff() {
        let (mut registry, _) = observed();
        let (h, seen) = recorder();
        let _ = registry.add("t1", h);
        deliver(registry.apply_publish(Message::publish("t1", 1, UpdateType::Full, Some(json!({"x": 1})))));
        deliver(registry.apply_publish(Message::publish("t1", 2, UpdateType::Diff, Some(json!({"x": 2})))));

        let events = seen.lock();
        assert_matches!(&events[0], TopicEvent::State { snapshot: Some(s), .. } if s.to_value() == json!({"x": 1}));
    }

    #[test]
    fn pass_through_leaves_snapshot() {
        let (mut registry, _) = observed();
        let (h, seen) = recorder();
        let _ = registry.add("t1", h);
        deliver(registry.apply_publish(Message::publish("t1", 1, UpdateType::Full, Some(json!({"x": 1})))));
        deliver(registry.apply_publish(Message::publish("t1", 2, UpdateType::Event, Some(json!({"ding": true})))));

        assert_eq!(registry.snapshot("t1").unwrap().to_value(), json!({"x": 1}));
        assert_eq!(registry.ts("t1"), Some(2));
        assert_matches!(
            &seen.lock()[1],
            TopicEvent::Notification { update_type: UpdateType::Event, body: Some(_), .. }
        );
    }

    #[test]
    fn close_removes_subscription_without_resubscribe() {
        let (mut registry, sent) = observed();
        let (h, seen) = recorder();
        let _ = registry.add("t1", h);
        assert_eq!(sent.lock().len(), 1);

        deliver(registry.apply_publish(Message::publish("t1", 5, UpdateType::Close, None)));
        assert!(registry.is_empty());
        assert_eq!(sent.lock().len(), 1);
        assert_matches!(&seen.lock()[0], TopicEvent::Closed { ts: 5, .. });

        let outcome = registry.apply_publish(Message::publish("t1", 6, UpdateType::Diff, Some(json!({}))));
        assert_matches!(outcome, PublishOutcome::TopicNotFound);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn unknown_topic_and_update_type_are_dropped_but_advance_cursor() {
        let (logs, _guard) = capture_logs();
        let (mut registry, _) = observed();
        let (h, seen) = recorder();
        let _ = registry.add("t1", h);

        assert_matches!(
            registry.apply_publish(Message::publish("nope", 1, UpdateType::Full, None)),
            PublishOutcome::TopicNotFound
        );
        assert!(logs.has_event(Level::DEBUG, "topic not found"));

        assert_matches!(
            registry.apply_publish(Message::publish("t1", 42, UpdateType::Other(7), None)),
            PublishOutcome::UnknownUpdateType(7)
        );
        assert_eq!(registry.ts("t1"), Some(42));
        assert!(registry.snapshot("t1").is_none());
        assert!(logs.has_event(Level::WARN, "unknown update type, dropping publish"));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn removing_last_handler_drops_topic() {
        let (mut registry, sent) = observed();
        let (a, _) = recorder();
        let (b, _) = recorder();
        let (id_a, _) = registry.add("t1", a);
        let (id_b, _) = registry.add("t1", b);

        assert!(registry.remove("t1", id_a));
        assert_eq!(registry.topics(), vec!["t1".to_string()]);
        assert_eq!(sent.lock().len(), 1);

        assert!(registry.remove("t1", id_b));
        assert!(registry.is_empty());
        assert_eq!(sent.lock().len(), 2);
        assert_eq!(sent.lock()[1].subscriptions, Some(Subscriptions::new()));

        assert!(!registry.remove("t1", id_b));
    }

    #[test]
    fn panicking_handler_does_not_stop_others() {
        let (mut registry, _) = observed();
        let boom: TopicHandler = Arc::new(|_: &TopicEvent| panic!("boom"));
        let (after, seen) = recorder();
        let _ = registry.add("t1", boom);
        let _ = registry.add("t1", after);
        seen.lock().clear();

        let sink = RecordingSink::default();
        let PublishOutcome::Delivered(delivery) =
            registry.apply_publish(Message::publish("t1", 1, UpdateType::Full, Some(json!({}))))
        else {
            panic!("expected delivery");
        };
        assert_eq!(delivery.dispatch(&sink), 1);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(sink.errors()[0]["name"], "handlerPanic");
        assert_eq!(sink.errors()[0]["message"], "boom");
    }

    #[test]
    fn handler_ids_are_distinct_per_registration() {
        let mut registry = SubscriptionRegistry::new(true, None);
        let (h, _) = recorder();
        let (a, _) = registry.add("t1", Arc::clone(&h));
        let (b, replay) = registry.add("t1", h);
        assert_ne!(a, b);
        assert!(replay.is_some());
        assert_eq!(registry.get("t1").unwrap().key(), "t1");
    }
}
