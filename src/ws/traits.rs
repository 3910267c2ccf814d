//! Seams between the connection state machine and the wire transport.

use async_trait::async_trait;
use secrecy::SecretString;

use super::error::WsError;
use super::types::{Envelope, TransportEvent};

/// Opens transport connections.
///
/// The connection manager calls [`Connector::connect`] once per connection attempt and
/// applies its own connect timeout around the returned future, so implementations do not
/// need one.
///
/// # Example
///
/// ```ignore
/// struct LoopbackConnector;
///
/// #[async_trait]
/// impl Connector for LoopbackConnector {
///     async fn connect(&self, url: &str, auth: Option<&SecretString>) -> Result<Box<dyn Transport>, WsError> {
///         Ok(Box::new(LoopbackTransport::default()))
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Perform the handshake with the server at `url`.
    async fn connect(
        &self,
        url: &str,
        auth_token: Option<&SecretString>,
    ) -> Result<Box<dyn Transport>, WsError>;
}

/// A live connection to the peer.
///
/// Owned exclusively by the connection manager's event loop.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Hand an envelope to the transport for delivery.
    ///
    /// Must not block; an error means the connection is no longer usable and the envelope
    /// is kept for the next connection. `Ok` only means the envelope was accepted: frames
    /// the transport has accepted but not yet written are lost if the connection drops.
    fn send(&mut self, envelope: Envelope) -> Result<(), WsError>;

    /// Wait for the next event from the peer.
    ///
    /// Must be cancel safe. After a [`TransportEvent::Closed`] it is not polled again.
    async fn recv(&mut self) -> TransportEvent;

    /// Start a client-initiated close. Resources may be released asynchronously.
    fn close(&mut self);
}
