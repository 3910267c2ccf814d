#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Each test binary only uses part of the shared harness"
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt as _};
use realtime_client::Event;
use realtime_client::ws::config::Config;
use realtime_client::ws::{Connector, DisconnectReason, Envelope, Transport, TransportEvent, WsError};
use secrecy::{ExposeSecret as _, SecretString};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Upper bound on how long a test waits for something that must happen.
pub const PATIENCE: Duration = Duration::from_secs(600);

/// Config with a heartbeat far enough out that it never interferes.
#[must_use]
pub fn config() -> Config {
    Config::builder()
        .url("ws://push.test")
        .heartbeat_interval(Duration::from_secs(3_600))
        .build()
}

/// What the next handshake does.
#[derive(Debug, Clone)]
pub enum Outcome {
    Accept,
    Fail(String),
    /// Server refuses the handshake
    Refuse(String),
    /// Never completes; left to the connect timeout
    Hang,
}

#[derive(Default)]
struct Script {
    outcomes: VecDeque<Outcome>,
    attempts: usize,
    tokens: Vec<Option<String>>,
}

/// In-memory connector. Unscripted handshakes are accepted.
#[derive(Clone)]
pub struct MockConnector {
    script: Arc<Mutex<Script>>,
    peers: mpsc::UnboundedSender<Peer>,
}

/// Test-side view of the connector: scripts handshakes and hands out the server end of
/// every accepted connection.
pub struct MockServer {
    script: Arc<Mutex<Script>>,
    peers: mpsc::UnboundedReceiver<Peer>,
}

#[must_use]
pub fn mock() -> (MockConnector, MockServer) {
    let script = Arc::new(Mutex::new(Script::default()));
    let (peers_tx, peers_rx) = mpsc::unbounded_channel();
    (
        MockConnector {
            script: Arc::clone(&script),
            peers: peers_tx,
        },
        MockServer {
            script,
            peers: peers_rx,
        },
    )
}

impl MockServer {
    pub fn script<I: IntoIterator<Item = Outcome>>(&self, outcomes: I) {
        self.script.lock().unwrap().outcomes.extend(outcomes);
    }

    /// Handshakes started so far, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.script.lock().unwrap().attempts
    }

    #[must_use]
    pub fn tokens(&self) -> Vec<Option<String>> {
        self.script.lock().unwrap().tokens.clone()
    }

    /// Wait for the next accepted connection.
    pub async fn accept(&mut self) -> Peer {
        timeout(PATIENCE, self.peers.recv())
            .await
            .expect("no connection accepted")
            .unwrap()
    }

    /// Connection accepted without waiting, if any.
    pub fn try_accept(&mut self) -> Option<Peer> {
        self.peers.try_recv().ok()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _url: &str,
        auth_token: Option<&SecretString>,
    ) -> Result<Box<dyn Transport>, WsError> {
        let outcome = {
            let mut script = self.script.lock().unwrap();
            script.attempts += 1;
            script
                .tokens
                .push(auth_token.map(|token| token.expose_secret().to_owned()));
            script.outcomes.pop_front().unwrap_or(Outcome::Accept)
        };

        match outcome {
            Outcome::Accept => {
                let (transport, peer) = pair();
                _ = self.peers.send(peer);
                Ok(Box::new(transport))
            }
            Outcome::Fail(reason) => Err(WsError::Transport(reason)),
            Outcome::Refuse(reason) => Err(WsError::Rejected(reason)),
            Outcome::Hang => futures::future::pending().await,
        }
    }
}

fn pair() -> (MockTransport, Peer) {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    (
        MockTransport {
            incoming: incoming_rx,
            outgoing: outgoing_tx,
            closed: Arc::clone(&closed),
        },
        Peer {
            incoming: incoming_tx,
            outgoing: outgoing_rx,
            closed,
        },
    )
}

struct MockTransport {
    incoming: mpsc::UnboundedReceiver<TransportEvent>,
    outgoing: mpsc::UnboundedSender<Envelope>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    fn send(&mut self, envelope: Envelope) -> Result<(), WsError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WsError::Transport("closed".to_owned()));
        }
        self.outgoing
            .send(envelope)
            .map_err(|_e| WsError::Transport("peer gone".to_owned()))
    }

    async fn recv(&mut self) -> TransportEvent {
        self.incoming
            .recv()
            .await
            .unwrap_or(TransportEvent::Closed(DisconnectReason::TransportClose))
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Server end of one connection.
pub struct Peer {
    incoming: mpsc::UnboundedSender<TransportEvent>,
    outgoing: mpsc::UnboundedReceiver<Envelope>,
    closed: Arc<AtomicBool>,
}

impl Peer {
    /// Push `data` on `event` to the client.
    pub fn push(&self, event: &str, data: Value) {
        self.incoming
            .send(TransportEvent::Message(Envelope::new(event, data)))
            .unwrap();
    }

    /// End the connection from the server side.
    pub fn close(&self, reason: DisconnectReason) {
        self.closed.store(true, Ordering::SeqCst);
        _ = self.incoming.send(TransportEvent::Closed(reason));
    }

    /// Wait for the next envelope the client sends.
    pub async fn next_sent(&mut self) -> Envelope {
        timeout(PATIENCE, self.outgoing.recv())
            .await
            .expect("nothing sent")
            .unwrap()
    }

    /// Everything the client has sent and not yet been read.
    pub fn sent(&mut self) -> Vec<Envelope> {
        let mut sent = Vec::new();
        while let Ok(envelope) = self.outgoing.try_recv() {
            sent.push(envelope);
        }
        sent
    }

    /// Whether the client closed this connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Wait for the next event named `name`, skipping the rest.
pub async fn next_named<S>(events: &mut S, name: &str) -> Event
where
    S: Stream<Item = realtime_client::Result<Event>> + Unpin,
{
    timeout(PATIENCE, async {
        loop {
            let event = events.next().await.unwrap().unwrap();
            if event.name() == name {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no `{name}` event"))
}

/// Record every event emitted under `names`, in order.
pub fn record(manager: &realtime_client::ConnectionManager, names: &[&str]) -> Arc<Mutex<Vec<Event>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for name in names {
        let log = Arc::clone(&log);
        manager.on(name, move |event| {
            log.lock().unwrap().push(event.clone());
            Ok(())
        });
    }
    log
}

/// Names of the recorded events.
#[must_use]
pub fn names(log: &Mutex<Vec<Event>>) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .map(|event| event.name().to_owned())
        .collect()
}
