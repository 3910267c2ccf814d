use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Event name of subscription requests sent to the peer.
pub const SUBSCRIBE_EVENT: &str = "subscribe";
/// Event name of unsubscription requests sent to the peer.
pub const UNSUBSCRIBE_EVENT: &str = "unsubscribe";
/// Event name of heartbeat probes.
pub const PING_EVENT: &str = "ping";
/// Event name of heartbeat acknowledgements.
pub const PONG_EVENT: &str = "pong";

/// Unit of data exchanged with the peer: a named event with an opaque JSON payload.
///
/// Serialized as `{"event": "market:update", "data": {...}}`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event or topic name
    pub event: String,
    /// Opaque payload
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    #[must_use]
    pub fn new<E: Into<String>>(event: E, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Request the peer to start pushing `topic` with the given parameters.
    #[must_use]
    pub fn subscribe(topic: &str, params: &Value) -> Self {
        Self::new(
            SUBSCRIBE_EVENT,
            json!({ "topic": topic, "params": params }),
        )
    }

    /// Request the peer to stop pushing `topic`.
    #[must_use]
    pub fn unsubscribe(topic: &str) -> Self {
        Self::new(UNSUBSCRIBE_EVENT, json!({ "topic": topic }))
    }

    /// Heartbeat probe; the peer answers with a `pong` echoing the same data.
    #[must_use]
    pub fn ping(id: u64, timestamp_ms: i64) -> Self {
        Self::new(PING_EVENT, json!({ "id": id, "timestamp": timestamp_ms }))
    }

    /// Whether this envelope is a heartbeat acknowledgement.
    #[must_use]
    pub fn is_pong(&self) -> bool {
        self.event == PONG_EVENT
    }
}

/// Why a transport connection ended.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the connection
    ServerClose {
        /// Close code sent by the peer, if any
        code: Option<u16>,
        /// Close reason sent by the peer
        reason: String,
    },
    /// The underlying stream ended without a close handshake
    TransportClose,
    /// Socket-level failure
    TransportError(String),
    /// The peer refused the session (policy violation, bad credentials)
    Rejected(String),
    /// `disconnect()` or `close()` was called
    ClientRequested,
}

impl DisconnectReason {
    /// Whether the connection manager reconnects on its own after this reason.
    ///
    /// Only peer-initiated and transport-level closes are retried. A client-requested
    /// close or a rejected session leaves the manager disconnected.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ServerClose { .. } | Self::TransportClose | Self::TransportError(_)
        )
    }

    /// Short machine-friendly label, used as the `disconnect` event payload.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ServerClose { .. } => "server close",
            Self::TransportClose => "transport close",
            Self::TransportError(_) => "transport error",
            Self::Rejected(_) => "rejected",
            Self::ClientRequested => "client disconnect",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerClose {
                code: Some(code),
                reason,
            } => write!(f, "server close ({code}): {reason}"),
            Self::ServerClose { code: None, reason } => write!(f, "server close: {reason}"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Something the transport observed on the wire.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The peer pushed an envelope
    Message(Envelope),
    /// The connection ended; no further events follow
    Closed(DisconnectReason),
}
