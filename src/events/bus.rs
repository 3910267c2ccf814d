use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_stream::try_stream;
use dashmap::DashMap;
use futures::Stream;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::{Event, names};
use crate::Result;
use crate::error::{BoxError, ListenerError};
use crate::ws::error::WsError;

/// Broadcast channel capacity for event streams.
const BROADCAST_CAPACITY: usize = 1024;

/// Callback invoked for every emission of the event it is registered under.
pub type Listener = Arc<dyn Fn(&Event) -> std::result::Result<(), BoxError> + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Publish/subscribe hub keyed by event name.
///
/// Listeners for one event run in registration order. A listener that returns an error or
/// panics does not stop the ones after it; the failure is reported once as a
/// `message_error` event. There is no cap on the number of listeners.
///
/// Every emission is also published on a broadcast channel for [`EventBus::stream`]
/// consumers.
pub struct EventBus {
    listeners: DashMap<String, Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
    broadcast_tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &self.listeners.len())
            .field("streams", &self.broadcast_tx.receiver_count())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            listeners: DashMap::new(),
            next_id: AtomicU64::new(0),
            broadcast_tx,
        }
    }

    /// Register `listener` for `event`.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .entry(event.to_owned())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered under `event`.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        let mut removed = false;
        self.listeners.remove_if_mut(event, |_, listeners| {
            let before = listeners.len();
            listeners.retain(|(registered, _)| *registered != id);
            removed = listeners.len() != before;
            listeners.is_empty()
        });
        removed
    }

    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, |listeners| listeners.len())
    }

    /// Deliver `event` to its listeners and to stream subscribers.
    ///
    /// Returns how many listeners failed.
    pub fn emit(&self, event: &Event) -> usize {
        let name = event.name();
        // Snapshot so listeners can register or remove listeners while being invoked.
        let listeners: Vec<Listener> = self
            .listeners
            .get(name)
            .map(|entry| entry.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        _ = self.broadcast_tx.send(event.clone());

        let mut failures = 0;
        for listener in listeners {
            let message = match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            failures += 1;

            #[cfg(feature = "tracing")]
            tracing::warn!(event = %name, error = %message, "Event listener failed");

            // A failing diagnostics listener is only logged, never re-reported.
            if name != names::MESSAGE_ERROR {
                self.emit(&Event::MessageError(ListenerError::new(name, message)));
            }
        }
        failures
    }

    /// Receiver of every emitted event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast_tx.subscribe()
    }

    /// Stream of every emitted event.
    ///
    /// Yields an error item when the consumer falls behind and events were dropped.
    pub fn stream(&self) -> impl Stream<Item = Result<Event>> + use<> {
        let mut rx = self.subscribe();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        yield event;
                    }
                    Err(RecvError::Lagged(n)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Event stream lagged, missed {n} events");
                        Err(WsError::Lagged { count: n })?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Stream of payloads pushed by the peer on `topic`.
    pub fn topic_stream(&self, topic: &str) -> impl Stream<Item = Result<Value>> + use<> {
        let mut rx = self.subscribe();
        let target = topic.to_owned();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(Event::Message { topic, payload }) if topic == target => {
                        yield payload;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(topic = %target, "Topic stream lagged, missed {n} events");
                        Err(WsError::Lagged { count: n })?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "listener panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::StreamExt as _;
    use serde_json::json;

    use super::*;
    use crate::events::Topic;

    fn message(topic: Topic, n: i64) -> Event {
        Event::Message {
            topic: topic.to_string(),
            payload: json!({ "n": n }),
        }
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let calls = Arc::clone(&calls);
            bus.on("market:update", move |_| {
                calls.lock().unwrap().push(label);
                Ok(())
            });
        }

        bus.emit(&message(Topic::MarketUpdate, 1));

        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn failing_listener_is_isolated_and_reported() {
        let bus = EventBus::new();
        let second_calls = Arc::new(Mutex::new(0));
        let diagnostics = Arc::new(Mutex::new(Vec::new()));

        bus.on("agent:status", |_| Err("bad payload".into()));
        let counter = Arc::clone(&second_calls);
        bus.on("agent:status", move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        let seen = Arc::clone(&diagnostics);
        bus.on(names::MESSAGE_ERROR, move |event| {
            if let Event::MessageError(error) = event {
                seen.lock().unwrap().push(error.clone());
            }
            Ok(())
        });

        let failures = bus.emit(&message(Topic::AgentStatus, 1));

        assert_eq!(failures, 1);
        assert_eq!(*second_calls.lock().unwrap(), 1);
        assert_eq!(
            *diagnostics.lock().unwrap(),
            vec![ListenerError::new("agent:status", "bad payload")]
        );
    }

    #[test]
    fn panicking_listener_is_caught() {
        let bus = EventBus::new();
        let reached = Arc::new(Mutex::new(false));

        bus.on("notification", |_| panic!("listener exploded"));
        let flag = Arc::clone(&reached);
        bus.on("notification", move |_| {
            *flag.lock().unwrap() = true;
            Ok(())
        });
        let diagnostics = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&diagnostics);
        bus.on(names::MESSAGE_ERROR, move |event| {
            if let Event::MessageError(error) = event {
                seen.lock().unwrap().push(error.message.clone());
            }
            Ok(())
        });

        assert_eq!(bus.emit(&message(Topic::Notification, 1)), 1);
        assert!(*reached.lock().unwrap());
        assert_eq!(*diagnostics.lock().unwrap(), vec!["listener exploded".to_owned()]);
    }

    #[test]
    fn failing_diagnostics_listener_does_not_recurse() {
        let bus = EventBus::new();
        bus.on("risk:alert", |_| Err("first".into()));
        bus.on(names::MESSAGE_ERROR, |_| Err("second".into()));

        assert_eq!(bus.emit(&message(Topic::RiskAlert, 1)), 1);
    }

    #[test]
    fn off_removes_only_that_listener() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&calls);
        let id = bus.on(names::CONNECT, move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        let counter = Arc::clone(&calls);
        bus.on(names::CONNECT, move |_| {
            *counter.lock().unwrap() += 10;
            Ok(())
        });

        assert!(bus.off(names::CONNECT, id));
        assert!(!bus.off(names::CONNECT, id));
        assert!(!bus.off(names::DISCONNECT, id));
        bus.emit(&Event::Connect);

        assert_eq!(*calls.lock().unwrap(), 10);
        assert_eq!(bus.listener_count(names::CONNECT), 1);
    }

    #[test]
    fn no_listener_cap() {
        let bus = EventBus::new();
        for _ in 0..10_000 {
            bus.on("portfolio:update", |_| Ok(()));
        }

        assert_eq!(bus.listener_count("portfolio:update"), 10_000);
        assert_eq!(bus.emit(&message(Topic::PortfolioUpdate, 1)), 0);
    }

    #[test]
    fn listener_may_register_during_emission() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);

        bus.on(names::CONNECT, move |_| {
            inner.on(names::CONNECT, |_| Ok(()));
            Ok(())
        });
        bus.emit(&Event::Connect);

        assert_eq!(bus.listener_count(names::CONNECT), 2);
    }

    #[tokio::test]
    async fn topic_stream_filters_by_topic() {
        let bus = EventBus::new();
        let mut stream = Box::pin(bus.topic_stream("market:update"));

        bus.emit(&message(Topic::AgentStatus, 1));
        bus.emit(&Event::Connect);
        bus.emit(&message(Topic::MarketUpdate, 2));

        let payload = stream.next().await.unwrap().unwrap();
        assert_eq!(payload, json!({ "n": 2 }));
    }

    #[tokio::test]
    async fn stream_reports_lag() {
        let bus = EventBus::new();
        let mut stream = Box::pin(bus.stream());

        for n in 0..(BROADCAST_CAPACITY + 10) {
            bus.emit(&message(Topic::MarketUpdate, i64::try_from(n).unwrap()));
        }

        let first = stream.next().await.unwrap();
        assert!(first.is_err(), "expected lag error");
    }
}
