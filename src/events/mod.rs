//! Events emitted by the connection manager.
//!
//! Lifecycle events have fixed names (see [`names`]); peer pushes are emitted under the
//! topic name they arrived with, e.g. [`Topic::MarketUpdate`] (`market:update`). Peer
//! pushes named after a lifecycle event are discarded.

pub mod bus;

use std::time::Duration;

use serde_json::Value;

pub use bus::{EventBus, Listener, ListenerId};

use crate::error::ListenerError;
use crate::ws::connection::StateSnapshot;
use crate::ws::error::WsError;
use crate::ws::types::DisconnectReason;

/// Names of the lifecycle events.
pub mod names {
    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const RECONNECT: &str = "reconnect";
    pub const RECONNECT_ATTEMPT: &str = "reconnect_attempt";
    pub const RECONNECT_ERROR: &str = "reconnect_error";
    pub const RECONNECT_FAILED: &str = "reconnect_failed";
    pub const STATE_CHANGE: &str = "state_change";
    pub const ERROR: &str = "error";
    pub const MESSAGE_ERROR: &str = "message_error";
    pub const LATENCY: &str = "latency";

    /// Every lifecycle event name.
    pub const ALL: [&str; 10] = [
        CONNECT,
        DISCONNECT,
        RECONNECT,
        RECONNECT_ATTEMPT,
        RECONNECT_ERROR,
        RECONNECT_FAILED,
        STATE_CHANGE,
        ERROR,
        MESSAGE_ERROR,
        LATENCY,
    ];

    /// Whether `name` is reserved for a lifecycle event and cannot be used as a data topic.
    #[must_use]
    pub fn is_lifecycle(name: &str) -> bool {
        ALL.contains(&name)
    }
}

/// Data topics pushed by the server.
///
/// Any other topic name works too; these are the ones the server is known to publish.
#[non_exhaustive]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::AsRefStr,
)]
pub enum Topic {
    #[strum(serialize = "agent:status")]
    AgentStatus,
    #[strum(serialize = "portfolio:update")]
    PortfolioUpdate,
    #[strum(serialize = "market:update")]
    MarketUpdate,
    #[strum(serialize = "arbitrage:opportunity")]
    ArbitrageOpportunity,
    #[strum(serialize = "transaction:update")]
    TransactionUpdate,
    #[strum(serialize = "risk:alert")]
    RiskAlert,
    #[strum(serialize = "notification")]
    Notification,
}

impl Topic {
    pub const ALL: [Self; 7] = [
        Self::AgentStatus,
        Self::PortfolioUpdate,
        Self::MarketUpdate,
        Self::ArbitrageOpportunity,
        Self::TransactionUpdate,
        Self::RiskAlert,
        Self::Notification,
    ];

    /// Look up a known topic by its wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|topic| topic.as_ref() == name)
    }
}

/// Something that happened on the connection, or a message from the peer.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Entered the connected state
    Connect,
    /// The transport went away
    Disconnect(DisconnectReason),
    /// A reconnection attempt succeeded
    Reconnect { attempt: u32 },
    /// A reconnection attempt is starting
    ReconnectAttempt { attempt: u32 },
    /// A reconnection attempt failed
    ReconnectError(WsError),
    /// Automatic reconnection gave up
    ReconnectFailed { attempts: u32 },
    /// Any state transition, with the full new state
    StateChange(StateSnapshot),
    /// A caller-driven connection attempt failed
    Error(WsError),
    /// A listener failed while handling another event
    MessageError(ListenerError),
    /// Heartbeat round-trip time
    Latency(Duration),
    /// The peer pushed `payload` on `topic`
    Message { topic: String, payload: Value },
}

impl Event {
    /// Name listeners register under to receive this event.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Connect => names::CONNECT,
            Self::Disconnect(_) => names::DISCONNECT,
            Self::Reconnect { .. } => names::RECONNECT,
            Self::ReconnectAttempt { .. } => names::RECONNECT_ATTEMPT,
            Self::ReconnectError(_) => names::RECONNECT_ERROR,
            Self::ReconnectFailed { .. } => names::RECONNECT_FAILED,
            Self::StateChange(_) => names::STATE_CHANGE,
            Self::Error(_) => names::ERROR,
            Self::MessageError(_) => names::MESSAGE_ERROR,
            Self::Latency(_) => names::LATENCY,
            Self::Message { topic, .. } => topic,
        }
    }

    /// Payload of a peer push, if this is one.
    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Message { payload, .. } => Some(payload),
            _ => None,
        }
    }
}
