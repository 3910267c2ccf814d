#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// WebSocket error variants.
///
/// Cloneable so the same failure can be published in state snapshots, carried by
/// events and handed to every pending `connect()` caller.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsError {
    /// The handshake did not complete within the connect timeout
    ConnectTimeout(Duration),
    /// Error connecting to or communicating with the server
    Transport(String),
    /// The server refused the handshake, e.g. because the auth token is invalid
    Rejected(String),
    /// Automatic reconnection gave up
    MaxAttemptsExceeded {
        /// Number of reconnection attempts made
        attempts: u32,
    },
    /// The connection manager was torn down
    ConnectionClosed,
    /// The connection was dropped before the operation could complete
    Disconnected,
    /// Event stream lagged and missed messages
    Lagged {
        /// Number of messages that were missed
        count: u64,
    },
}

impl WsError {
    /// Whether automatic reconnection should be attempted after this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::ConnectTimeout(_) | Self::Transport(_))
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectTimeout(after) => {
                write!(f, "connection not established within {after:?}")
            }
            Self::Transport(reason) => write!(f, "WebSocket transport error: {reason}"),
            Self::Rejected(reason) => write!(f, "handshake rejected: {reason}"),
            Self::MaxAttemptsExceeded { attempts } => {
                write!(f, "gave up reconnecting after {attempts} attempts")
            }
            Self::ConnectionClosed => write!(f, "connection manager closed"),
            Self::Disconnected => write!(f, "disconnected before the operation completed"),
            Self::Lagged { count } => write!(f, "event stream lagged, missed {count} events"),
        }
    }
}

impl StdError for WsError {}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Connection, e)
    }
}

#[cfg(feature = "ws")]
impl From<tokio_tungstenite::tungstenite::Error> for WsError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        use tokio_tungstenite::tungstenite::http::StatusCode;

        match e {
            Error::Http(response)
                if matches!(
                    response.status(),
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                ) =>
            {
                Self::Rejected(response.status().to_string())
            }
            e => Self::Transport(e.to_string()),
        }
    }
}
