#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::Stream;
use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::backoff::BackoffPolicy;
use super::config::Config;
use super::error::WsError;
use super::machine::ConnectionLoop;
use super::traits::Connector;
use crate::Result;
use crate::error::BoxError;
use crate::events::{Event, EventBus, ListenerId};
use crate::subscription::{Subscription, SubscriptionOptions};

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Successfully connected
    Connected,
    /// Waiting out the backoff delay before the next reconnection attempt
    Reconnecting,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Full connection state as published on every transition.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub state: ConnectionState,
    /// Error that caused the most recent failure, cleared on a successful connection
    pub last_error: Option<WsError>,
    /// Reconnection attempts made in the current failure episode
    pub reconnect_attempt: u32,
}

impl StateSnapshot {
    pub(crate) const fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
            reconnect_attempt: 0,
        }
    }
}

/// Reconnection progress within one failure episode.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempt: u32,
    pub next_delay: Duration,
}

impl ReconnectState {
    pub(crate) const fn new(base: Duration) -> Self {
        Self {
            attempt: 0,
            next_delay: base,
        }
    }

    pub(crate) fn reset(&mut self, base: Duration) {
        *self = Self::new(base);
    }
}

/// Observability counters.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub connected: bool,
    pub reconnect_attempts: u32,
    pub queue_size: usize,
    pub subscription_count: usize,
    /// Latest heartbeat round-trip time
    pub latency: Option<Duration>,
}

/// Requests from [`ConnectionManager`] handles to the connection loop.
pub(crate) enum Command {
    Connect {
        auth_token: Option<SecretString>,
        reply: oneshot::Sender<std::result::Result<(), WsError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        topic: String,
        payload: Value,
    },
    Subscribe {
        topic: String,
        params: Value,
        options: SubscriptionOptions,
    },
    Unsubscribe {
        topic: String,
    },
    Subscriptions {
        reply: oneshot::Sender<Vec<Subscription>>,
    },
    Stats {
        reply: oneshot::Sender<Stats>,
    },
}

/// Manages the connection lifecycle, reconnection, heartbeat, outbound buffering and
/// event fan-out.
///
/// All state lives in a background task that processes one command or transport event at
/// a time; this type is a cheap handle to it. Clones share the same connection. The
/// task is torn down by [`ConnectionManager::close`] or when the last handle is dropped.
///
/// Listeners are owned by the task, so a listener holding a clone keeps the task alive
/// until [`ConnectionManager::close`] is called. Listeners that need the manager should
/// capture a [`WeakConnectionManager`] from [`ConnectionManager::downgrade`] instead.
///
/// # Example
///
/// ```no_run
/// use realtime_client::events::{Event, Topic};
/// use realtime_client::ws::ConnectionManager;
/// use realtime_client::ws::config::Config;
///
/// # async fn example() -> realtime_client::Result<()> {
/// let manager = ConnectionManager::new(Config::builder().url("wss://push.example.com").build())?;
///
/// manager.on(Topic::MarketUpdate.as_ref(), |event: &Event| {
///     println!("market update: {:?}", event.payload());
///     Ok(())
/// });
/// manager.subscribe(Topic::MarketUpdate.as_ref(), serde_json::json!({ "symbols": ["BTC"] }), Default::default())?;
/// manager.connect(None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<StateSnapshot>,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl ConnectionManager {
    /// Create a manager that connects over WebSocket with jittered exponential backoff.
    ///
    /// Must be called from within a Tokio runtime. Nothing connects until
    /// [`ConnectionManager::connect`] is called.
    #[cfg(feature = "ws")]
    pub fn new(config: Config) -> Result<Self> {
        let backoff = super::backoff::ExponentialBackoff::from(&config);
        Self::with_connector(config, super::transport::WsConnector, backoff)
    }

    /// Create a manager with a custom transport and reconnection delay policy.
    pub fn with_connector<C, B>(config: Config, connector: C, backoff: B) -> Result<Self>
    where
        C: Connector,
        B: BackoffPolicy,
    {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(StateSnapshot::initial());
        let bus = Arc::new(EventBus::new());
        let shutdown = CancellationToken::new();

        let connection = ConnectionLoop::new(
            config,
            Arc::new(connector),
            Arc::new(backoff),
            Arc::clone(&bus),
            state_tx,
        );
        tokio::spawn(connection.run(commands_rx, shutdown.clone()));

        Ok(Self {
            inner: Arc::new(Inner {
                commands: commands_tx,
                state_rx,
                bus,
                shutdown,
            }),
        })
    }

    fn post(&self, command: Command) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(WsError::ConnectionClosed.into());
        }
        self.inner
            .commands
            .send(command)
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }

    /// Connect to the server.
    ///
    /// Resolves once connected, or fails on handshake error or connect timeout. Calling it
    /// while a connection attempt is already in flight joins that attempt; calling it while
    /// connected returns immediately.
    pub async fn connect(&self, auth_token: Option<SecretString>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Connect { auth_token, reply })?;
        rx.await.map_err(|_e| WsError::ConnectionClosed)??;
        Ok(())
    }

    /// Close the connection on request of the caller.
    ///
    /// The manager stays disconnected, and pending subscriptions and queued messages are
    /// discarded. Returns once the state change has taken effect; the transport is released
    /// in the background. The manager can be connected again afterwards.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Disconnect { reply })?;
        rx.await.map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }

    /// Tear the manager down for good.
    ///
    /// Every clone of this handle stops working; later calls fail with
    /// [`WsError::ConnectionClosed`].
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Send `payload` on `topic`, or queue it until the connection is back.
    pub fn send<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> Result<()> {
        let payload = serde_json::to_value(payload)?;
        self.post(Command::Send {
            topic: topic.to_owned(),
            payload,
        })
    }

    /// Ask the server to push `topic`. Replaces the parameters of an existing subscription.
    ///
    /// Sent right away when connected, and again after every reconnect.
    pub fn subscribe(&self, topic: &str, params: Value, options: SubscriptionOptions) -> Result<()> {
        self.post(Command::Subscribe {
            topic: topic.to_owned(),
            params,
            options,
        })
    }

    /// Stop the server from pushing `topic`. Local listeners stay registered.
    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.post(Command::Unsubscribe {
            topic: topic.to_owned(),
        })
    }

    /// Active subscriptions, ordered by topic.
    pub async fn subscriptions(&self) -> Result<Vec<Subscription>> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Subscriptions { reply })?;
        Ok(rx.await.map_err(|_e| WsError::ConnectionClosed)?)
    }

    /// Current counters, consistent with every call made before this one.
    pub async fn stats(&self) -> Result<Stats> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Stats { reply })?;
        Ok(rx.await.map_err(|_e| WsError::ConnectionClosed)?)
    }

    /// Register a listener for a lifecycle event name or a topic name.
    pub fn on<F>(&self, event: &str, listener: F) -> ListenerId
    where
        F: Fn(&Event) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.inner.bus.on(event, listener)
    }

    /// Remove a listener registered with [`ConnectionManager::on`].
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.bus.off(event, id)
    }

    /// Stream of every event.
    pub fn events(&self) -> impl Stream<Item = Result<Event>> + use<> {
        self.inner.bus.stream()
    }

    /// Stream of payloads the server pushes on `topic`.
    pub fn topic(&self, topic: &str) -> impl Stream<Item = Result<Value>> + use<> {
        self.inner.bus.topic_stream(topic)
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> StateSnapshot {
        self.inner.state_rx.borrow().clone()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<StateSnapshot> {
        self.inner.state_rx.clone()
    }

    /// Create a handle that does not keep the connection alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning handle to a [`ConnectionManager`], for use inside listeners.
#[derive(Clone)]
pub struct WeakConnectionManager {
    inner: Weak<Inner>,
}

impl WeakConnectionManager {
    /// The manager, unless every [`ConnectionManager`] handle has been dropped.
    #[must_use]
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}
