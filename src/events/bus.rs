//! In-process event bus.
//!
//! Subscriptions are stored per [`EventKind`] in registration order. A
//! publish clones the handler list under the lock, then invokes handlers
//! outside it so a handler may itself publish. A panicking handler is caught
//! and logged; it never unwinds past the bus and never starves siblings.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{DomainEvent, EventKind};

/// Boxed future returned by event handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// An event handler: takes the event by value (events are cheap clones) and
/// returns a future. Synchronous handlers return an already-ready future.
pub type EventHandler = Arc<dyn Fn(DomainEvent) -> HandlerFuture + Send + Sync>;

struct Subscription {
    id: String,
    handler: EventHandler,
}

#[derive(Default)]
struct BusState {
    subscriptions: HashMap<EventKind, Vec<Subscription>>,
    history: VecDeque<DomainEvent>,
    closed: bool,
}

/// Process-wide event bus. Construct once at startup and share via `Arc`.
pub struct EventBus {
    state: Mutex<BusState>,
    history_size: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_size(100)
    }

    pub fn with_history_size(history_size: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            history_size,
        }
    }

    /// Subscribe a handler to one event kind. Returns a subscription id.
    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> String {
        let id = Uuid::new_v4().to_string();
        let mut state = self.state.lock().unwrap();
        state
            .subscriptions
            .entry(kind)
            .or_default()
            .push(Subscription {
                id: id.clone(),
                handler,
            });
        debug!(kind = ?kind, subscription_id = %id, "subscribed handler");
        id
    }

    /// Convenience wrapper for synchronous handlers.
    pub fn subscribe_fn<F>(&self, kind: EventKind, f: F) -> String
    where
        F: Fn(DomainEvent) + Send + Sync + 'static,
    {
        self.subscribe(
            kind,
            Arc::new(move |event| {
                f(event);
                Box::pin(async {}) as HandlerFuture
            }),
        )
    }

    /// Remove one subscription by id. Returns true if it existed.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        for subs in state.subscriptions.values_mut() {
            if let Some(pos) = subs.iter().position(|s| s.id == subscription_id) {
                subs.remove(pos);
                return true;
            }
        }
        false
    }

    /// Remove every subscription bound to the given handler (pointer
    /// identity). Returns the number removed.
    pub fn unsubscribe_all(&self, handler: &EventHandler) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut removed = 0;
        for subs in state.subscriptions.values_mut() {
            let before = subs.len();
            subs.retain(|s| !Arc::ptr_eq(&s.handler, handler));
            removed += before - subs.len();
        }
        removed
    }

    /// Publish one event to every subscription for its kind, in registration
    /// order. The event is recorded in history even when nobody listens.
    pub async fn publish(&self, event: DomainEvent) {
        let handlers: Vec<(String, EventHandler)> = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                error!(event_type = event.event_type(), "publish on closed event bus");
                return;
            }
            state.history.push_back(event.clone());
            while state.history.len() > self.history_size {
                state.history.pop_front();
            }
            state
                .subscriptions
                .get(&event.kind())
                .map(|subs| {
                    subs.iter()
                        .map(|s| (s.id.clone(), Arc::clone(&s.handler)))
                        .collect()
                })
                .unwrap_or_default()
        };

        if handlers.is_empty() {
            debug!(
                event_type = event.event_type(),
                "no handlers subscribed (event recorded in history)"
            );
            return;
        }

        info!(
            event_type = event.event_type(),
            event_id = %event.event_id,
            correlation_id = %event.correlation_id,
            handlers = handlers.len(),
            "publishing event"
        );

        for (subscription_id, handler) in handlers {
            // The handler is invoked inside the async block so a panic in a
            // synchronous handler body is caught the same way as one in a
            // polled future.
            let event_for_handler = event.clone();
            let fut = async move { handler(event_for_handler).await };
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                error!(
                    subscription_id = %subscription_id,
                    event_type = event.event_type(),
                    panic = %msg,
                    "event handler panicked; continuing with remaining handlers"
                );
            }
        }
    }

    /// Publish events in order.
    pub async fn publish_batch(&self, events: Vec<DomainEvent>) {
        for event in events {
            self.publish(event).await;
        }
    }

    /// Most recent events, newest first.
    pub fn history(&self, limit: Option<usize>) -> Vec<DomainEvent> {
        let state = self.state.lock().unwrap();
        let iter = state.history.iter().rev();
        match limit {
            Some(n) => iter.take(n).cloned().collect(),
            None => iter.cloned().collect(),
        }
    }

    pub fn subscription_count(&self, kind: Option<EventKind>) -> usize {
        let state = self.state.lock().unwrap();
        match kind {
            Some(k) => state.subscriptions.get(&k).map_or(0, |s| s.len()),
            None => state.subscriptions.values().map(|s| s.len()).sum(),
        }
    }

    /// Close the bus: drop all subscriptions and refuse further publishes.
    /// Only the test shutdown path calls this.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.subscriptions.clear();
        state.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn started_event(job_id: &str) -> DomainEvent {
        DomainEvent::new(
            "corr-1",
            EventPayload::JobStarted {
                job_id: job_id.into(),
                issue_number: Some(1),
                repository: "o/r".into(),
                agent_type: "resolve-issue".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        bus.subscribe_fn(EventKind::JobStarted, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(started_event("j1")).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handlers_invoked_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe_fn(EventKind::JobStarted, move |_| {
                order.lock().unwrap().push(tag);
            });
        }

        bus.publish(started_event("j1")).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_abort_siblings() {
        let bus = EventBus::new();
        let reached = Arc::new(AtomicUsize::new(0));
        bus.subscribe_fn(EventKind::JobFailed, |_| panic!("boom"));
        let reached_clone = Arc::clone(&reached);
        bus.subscribe_fn(EventKind::JobFailed, move |_| {
            reached_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(DomainEvent::new(
            "c",
            EventPayload::JobFailed {
                job_id: "j".into(),
                issue_number: None,
                repository: String::new(),
                error_message: "e".into(),
                error_type: "AgentTimeout".into(),
                duration_seconds: 0.1,
            },
        ))
        .await;

        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let sub_id = bus.subscribe_fn(EventKind::JobStarted, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(started_event("j1")).await;
        assert!(bus.unsubscribe(&sub_id));
        assert!(!bus.unsubscribe(&sub_id));
        bus.publish(started_event("j2")).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_by_handler_identity() {
        let bus = EventBus::new();
        let handler: EventHandler = Arc::new(|_| Box::pin(async {}));
        bus.subscribe(EventKind::JobStarted, Arc::clone(&handler));
        bus.subscribe(EventKind::JobCompleted, Arc::clone(&handler));
        bus.subscribe_fn(EventKind::JobStarted, |_| {});

        assert_eq!(bus.unsubscribe_all(&handler), 2);
        assert_eq!(bus.subscription_count(None), 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_newest_first() {
        let bus = EventBus::with_history_size(3);
        for i in 0..5 {
            bus.publish(started_event(&format!("j{i}"))).await;
        }
        let history = bus.history(None);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].job_id(), Some("j4"));
        assert_eq!(history[2].job_id(), Some("j2"));
    }

    #[tokio::test]
    async fn test_event_recorded_in_history_without_subscribers() {
        let bus = EventBus::new();
        bus.publish(started_event("lonely")).await;
        assert_eq!(bus.history(None).len(), 1);
    }

    #[tokio::test]
    async fn test_closed_bus_rejects_publish() {
        let bus = EventBus::new();
        bus.close();
        bus.publish(started_event("j")).await;
        assert!(bus.history(None).is_empty());
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn test_publish_batch_preserves_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe_fn(EventKind::JobStarted, move |e| {
            seen_clone
                .lock()
                .unwrap()
                .push(e.job_id().unwrap().to_string());
        });

        bus.publish_batch(vec![
            started_event("a"),
            started_event("b"),
            started_event("c"),
        ])
        .await;
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }
}
