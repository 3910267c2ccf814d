//! The connection loop: a single task that owns the transport and every piece of
//! connection state, and processes commands and transport events one at a time.

use std::future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Sleep, sleep, timeout};
use tokio_util::sync::CancellationToken;

use super::backoff::BackoffPolicy;
use super::config::Config;
use super::connection::{Command, ConnectionState, ReconnectState, StateSnapshot, Stats};
use super::error::WsError;
use super::heartbeat::HeartbeatMonitor;
use super::queue::OutboundQueue;
use super::traits::{Connector, Transport};
use super::types::{DisconnectReason, Envelope, TransportEvent};
use crate::events::{Event, EventBus, names};
use crate::subscription::{SubscriptionOptions, SubscriptionRegistry};

type Handshake = BoxFuture<'static, Result<Box<dyn Transport>, WsError>>;
type ConnectReply = oneshot::Sender<Result<(), WsError>>;

pub(crate) struct ConnectionLoop {
    config: Config,
    connector: Arc<dyn Connector>,
    backoff: Arc<dyn BackoffPolicy>,
    bus: Arc<EventBus>,
    state_tx: watch::Sender<StateSnapshot>,
    state: ConnectionState,
    last_error: Option<WsError>,
    reconnect: ReconnectState,
    /// The only live transport, present exactly while connected
    transport: Option<Box<dyn Transport>>,
    /// In-flight handshake, connect timeout included; present exactly while connecting
    handshake: Option<Handshake>,
    /// Backoff delay; present exactly while reconnecting
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    heartbeat: HeartbeatMonitor,
    queue: OutboundQueue,
    subscriptions: SubscriptionRegistry,
    /// `connect()` callers waiting for the current attempt to settle
    waiters: Vec<ConnectReply>,
    auth_token: Option<SecretString>,
}

impl ConnectionLoop {
    pub(crate) fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        backoff: Arc<dyn BackoffPolicy>,
        bus: Arc<EventBus>,
        state_tx: watch::Sender<StateSnapshot>,
    ) -> Self {
        Self {
            reconnect: ReconnectState::new(config.reconnect_base_delay),
            heartbeat: HeartbeatMonitor::new(config.heartbeat_interval),
            queue: OutboundQueue::new(config.queue_capacity),
            config,
            connector,
            backoff,
            bus,
            state_tx,
            state: ConnectionState::Disconnected,
            last_error: None,
            transport: None,
            handshake: None,
            reconnect_timer: None,
            subscriptions: SubscriptionRegistry::new(),
            waiters: Vec::new(),
            auth_token: None,
        }
    }

    /// Process commands and transport events until shut down or every handle is dropped.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                result = poll_handshake(&mut self.handshake) => {
                    self.handshake = None;
                    match result {
                        Ok(transport) => self.on_connected(transport),
                        Err(error) => self.on_connect_failed(error),
                    }
                }

                event = recv_transport(&mut self.transport) => self.on_transport_event(event),

                () = wait_reconnect(&mut self.reconnect_timer) => {
                    self.reconnect_timer = None;
                    self.start_reconnect_attempt();
                }

                () = self.heartbeat.tick() => self.send_probe(),
            }
        }

        self.teardown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { auth_token, reply } => self.connect(auth_token, reply),
            Command::Disconnect { reply } => {
                self.disconnect(WsError::Disconnected);
                _ = reply.send(());
            }
            Command::Send { topic, payload } => self.send(topic, payload),
            Command::Subscribe {
                topic,
                params,
                options,
            } => self.subscribe(&topic, params, options),
            Command::Unsubscribe { topic } => self.unsubscribe(&topic),
            Command::Subscriptions { reply } => {
                _ = reply.send(self.subscriptions.list_active());
            }
            Command::Stats { reply } => {
                _ = reply.send(self.stats());
            }
        }
    }

    fn connect(&mut self, auth_token: Option<SecretString>, reply: ConnectReply) {
        if auth_token.is_some() {
            self.auth_token = auth_token;
        }

        match self.state {
            ConnectionState::Connected => {
                _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting => {
                // Join the attempt in flight rather than opening a second transport.
                self.waiters.push(reply);
            }
            ConnectionState::Reconnecting => {
                self.waiters.push(reply);
                self.reconnect_timer = None;
                self.start_reconnect_attempt();
            }
            ConnectionState::Disconnected => {
                self.waiters.push(reply);
                self.reconnect.reset(self.config.reconnect_base_delay);
                self.last_error = None;
                self.begin_handshake();
            }
        }
    }

    fn begin_handshake(&mut self) {
        let connector = Arc::clone(&self.connector);
        let url = self.config.url.clone();
        let auth_token = self.auth_token.clone();
        let limit = self.config.connect_timeout;

        self.handshake = Some(Box::pin(async move {
            match timeout(limit, connector.connect(&url, auth_token.as_ref())).await {
                Ok(result) => result,
                Err(_elapsed) => Err(WsError::ConnectTimeout(limit)),
            }
        }));
        self.set_state(ConnectionState::Connecting);
    }

    fn on_connected(&mut self, transport: Box<dyn Transport>) {
        let attempt = self.reconnect.attempt;
        self.transport = Some(transport);
        self.reconnect.reset(self.config.reconnect_base_delay);
        self.last_error = None;
        self.set_state(ConnectionState::Connected);

        self.replay_subscriptions();
        self.drain_queue();
        self.heartbeat.start();

        if attempt > 0 {
            self.bus.emit(&Event::Reconnect { attempt });
        }
        self.bus.emit(&Event::Connect);
        self.settle_waiters(&Ok(()));
    }

    fn on_connect_failed(&mut self, error: WsError) {
        #[cfg(feature = "tracing")]
        tracing::warn!(%error, attempt = self.reconnect.attempt, "Unable to connect");

        self.last_error = Some(error.clone());

        if self.reconnect.attempt > 0 {
            self.bus.emit(&Event::ReconnectError(error.clone()));
            if error.is_recoverable() {
                self.schedule_reconnect();
                return;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.bus.emit(&Event::Error(error.clone()));
        self.settle_waiters(&Err(error));
    }

    /// Wait out the backoff before the next attempt, or give up once the attempts are spent.
    fn schedule_reconnect(&mut self) {
        let attempts = self.reconnect.attempt;
        if attempts >= self.config.max_reconnect_attempts {
            #[cfg(feature = "tracing")]
            tracing::warn!(attempts, "Giving up reconnecting");

            let error = WsError::MaxAttemptsExceeded { attempts };
            self.last_error = Some(error.clone());
            self.set_state(ConnectionState::Disconnected);
            self.bus.emit(&Event::ReconnectFailed { attempts });
            self.settle_waiters(&Err(error));
            return;
        }

        let delay = self.backoff.delay(attempts.saturating_add(1));
        self.reconnect.next_delay = delay;
        self.reconnect_timer = Some(Box::pin(sleep(delay)));

        #[cfg(feature = "tracing")]
        tracing::debug!(?delay, next_attempt = attempts + 1, "Scheduling reconnect");

        self.set_state(ConnectionState::Reconnecting);
    }

    fn start_reconnect_attempt(&mut self) {
        self.reconnect.attempt = self.reconnect.attempt.saturating_add(1);
        self.bus.emit(&Event::ReconnectAttempt {
            attempt: self.reconnect.attempt,
        });
        self.begin_handshake();
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(envelope) if envelope.is_pong() => {
                if let Some(rtt) = self.heartbeat.on_pong(&envelope.data) {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(?rtt, "Heartbeat acknowledged");
                    self.bus.emit(&Event::Latency(rtt));
                }
            }
            TransportEvent::Message(envelope) if names::is_lifecycle(&envelope.event) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(event = %envelope.event, "Dropping peer message with a reserved event name");
                #[cfg(not(feature = "tracing"))]
                let _ = &envelope;
            }
            TransportEvent::Message(envelope) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(event = %envelope.event, "Received message");
                self.bus.emit(&Event::Message {
                    topic: envelope.event,
                    payload: envelope.data,
                });
            }
            TransportEvent::Closed(reason) => self.on_transport_closed(reason),
        }
    }

    fn on_transport_closed(&mut self, reason: DisconnectReason) {
        #[cfg(feature = "tracing")]
        tracing::info!(%reason, "Connection lost");

        self.heartbeat.stop();
        self.transport = None;
        self.subscriptions.retain_auto_reconnect();

        self.last_error = Some(WsError::Transport(reason.to_string()));
        self.set_state(ConnectionState::Disconnected);
        self.bus.emit(&Event::Disconnect(reason.clone()));

        if reason.is_recoverable() {
            self.schedule_reconnect();
        }
    }

    /// Caller-requested close: stop everything and forget pending work.
    fn disconnect(&mut self, waiter_error: WsError) {
        self.handshake = None;
        self.reconnect_timer = None;
        self.heartbeat.stop();
        let had_transport = match self.transport.take() {
            Some(mut transport) => {
                transport.close();
                true
            }
            None => false,
        };

        self.subscriptions.clear();
        self.queue.clear();
        self.reconnect.reset(self.config.reconnect_base_delay);
        self.last_error = None;

        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
        }
        if had_transport {
            self.bus.emit(&Event::Disconnect(DisconnectReason::ClientRequested));
        }
        self.settle_waiters(&Err(waiter_error));
    }

    fn teardown(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::debug!("Connection manager shutting down");

        self.disconnect(WsError::ConnectionClosed);
        self.last_error = Some(WsError::ConnectionClosed);
        self.state_tx.send_replace(self.snapshot());
    }

    fn send(&mut self, topic: String, payload: Value) {
        if self.state.is_connected()
            && let Some(transport) = self.transport.as_mut()
        {
            let envelope = Envelope::new(topic, payload);
            match transport.send(envelope.clone()) {
                Ok(()) => return,
                Err(e) => {
                    // Keep the message; the transport reports the close next.
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "Send failed, queueing message");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                    self.enqueue(envelope.event, envelope.data);
                    return;
                }
            }
        }
        self.enqueue(topic, payload);
    }

    fn enqueue(&mut self, topic: String, payload: Value) {
        if let Some(evicted) = self.queue.enqueue(topic, payload) {
            #[cfg(feature = "tracing")]
            tracing::warn!(topic = %evicted.topic, "Outbound queue full, dropped oldest message");
            #[cfg(not(feature = "tracing"))]
            let _ = &evicted;
        }
    }

    fn subscribe(&mut self, topic: &str, params: Value, options: SubscriptionOptions) {
        self.subscriptions.subscribe(topic, params.clone(), options);
        if self.state.is_connected() {
            self.send_subscription(topic, &params);
        }
    }

    fn unsubscribe(&mut self, topic: &str) {
        if self.subscriptions.unsubscribe(topic).is_some()
            && self.state.is_connected()
            && let Some(transport) = self.transport.as_mut()
            && let Err(e) = transport.send(Envelope::unsubscribe(topic))
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(%topic, error = %e, "Failed to send unsubscribe request");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    fn send_subscription(&mut self, topic: &str, params: &Value) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        match transport.send(Envelope::subscribe(topic, params)) {
            Ok(()) => self.subscriptions.record_success(topic),
            Err(error) => {
                self.subscriptions.record_failure(topic, &error);
            }
        }
    }

    /// Send every registered subscription to the peer, once each.
    fn replay_subscriptions(&mut self) {
        let requests = self.subscriptions.requests();

        #[cfg(feature = "tracing")]
        if !requests.is_empty() {
            tracing::debug!(count = requests.len(), "Re-establishing subscriptions");
        }

        for (topic, params) in requests {
            self.send_subscription(&topic, &params);
        }
    }

    fn drain_queue(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let result = self
            .queue
            .drain_into(|message| transport.send(message.to_envelope()));

        match result {
            Ok(sent) => {
                #[cfg(feature = "tracing")]
                if sent > 0 {
                    tracing::debug!(sent, "Flushed outbound queue");
                }
                #[cfg(not(feature = "tracing"))]
                let _ = sent;
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, remaining = self.queue.len(), "Stopped flushing outbound queue");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    fn send_probe(&mut self) {
        let probe = self.heartbeat.probe();
        if let Some(transport) = self.transport.as_mut()
            && let Err(e) = transport.send(probe)
        {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %e, "Failed to send heartbeat");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    fn settle_waiters(&mut self, outcome: &Result<(), WsError>) {
        for waiter in self.waiters.drain(..) {
            _ = waiter.send(outcome.clone());
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.state,
            last_error: self.last_error.clone(),
            reconnect_attempt: self.reconnect.attempt,
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        #[cfg(feature = "tracing")]
        tracing::debug!(from = %self.state, to = %state, "Connection state change");

        self.state = state;
        let snapshot = self.snapshot();
        self.state_tx.send_replace(snapshot.clone());
        self.bus.emit(&Event::StateChange(snapshot));
    }

    fn stats(&self) -> Stats {
        Stats {
            connected: self.state.is_connected(),
            reconnect_attempts: self.reconnect.attempt,
            queue_size: self.queue.len(),
            subscription_count: self.subscriptions.len(),
            latency: self.heartbeat.latency(),
        }
    }
}

async fn poll_handshake(handshake: &mut Option<Handshake>) -> Result<Box<dyn Transport>, WsError> {
    match handshake.as_mut() {
        Some(handshake) => handshake.await,
        None => future::pending().await,
    }
}

async fn recv_transport(transport: &mut Option<Box<dyn Transport>>) -> TransportEvent {
    match transport.as_mut() {
        Some(transport) => transport.recv().await,
        None => future::pending().await,
    }
}

async fn wait_reconnect(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer.as_mut() {
        Some(timer) => timer.as_mut().await,
        None => future::pending().await,
    }
}
