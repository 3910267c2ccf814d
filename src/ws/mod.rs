//! Connection management for the push server.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: Handle to the background connection loop with reconnection,
//!   heartbeat and outbound buffering
//! - [`Connector`] / [`Transport`]: The wire seam; [`transport::WsConnector`] speaks
//!   WebSocket, tests plug in an in-memory transport
//! - [`BackoffPolicy`]: Delay before each reconnection attempt
//!
//! # Example
//!
//! ```ignore
//! let manager = ConnectionManager::new(Config::default())?;
//! manager.subscribe("market:update", json!({ "symbols": ["BTC"] }), Default::default())?;
//! manager.connect(None).await?;
//! ```

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub(crate) mod machine;
pub mod queue;
pub mod traits;
#[cfg(feature = "ws")]
pub mod transport;
pub mod types;

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use connection::{
    ConnectionManager, ConnectionState, StateSnapshot, Stats, WeakConnectionManager,
};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
pub use types::{DisconnectReason, Envelope, TransportEvent};
