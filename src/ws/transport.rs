//! WebSocket transport built on `tokio-tungstenite`.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use secrecy::{ExposeSecret as _, SecretString};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::error::WsError;
use super::traits::{Connector, Transport};
use super::types::{DisconnectReason, Envelope, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Query parameter carrying the auth token during the handshake.
const AUTH_TOKEN_PARAM: &str = "token";

/// Opens JSON-over-WebSocket connections.
///
/// Each envelope travels as one text frame. The auth token, when given, is appended to
/// the URL as a `token` query parameter.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        auth_token: Option<&SecretString>,
    ) -> Result<Box<dyn Transport>, WsError> {
        let mut url = Url::parse(url).map_err(|e| WsError::Transport(e.to_string()))?;
        if let Some(token) = auth_token {
            url.query_pairs_mut()
                .append_pair(AUTH_TOKEN_PARAM, token.expose_secret());
        }

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (write, read) = ws_stream.split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(write_loop(write, outgoing_rx));

        Ok(Box::new(WsTransport { outgoing_tx, read }))
    }
}

/// Write queued frames to the socket until a close frame is sent or a write fails.
async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outgoing_rx.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if let Err(e) = write.send(message).await {
            let lost = discard_pending(&mut outgoing_rx);
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, lost, "WebSocket write failed, pending frames dropped");
            #[cfg(not(feature = "tracing"))]
            let _ = (&e, lost);
            break;
        }
        if is_close {
            break;
        }
    }
    _ = write.close().await;
}

/// Stop accepting frames and count the ones that will never be written.
///
/// Once closed, [`WsTransport::send`] fails, so the connection manager buffers later
/// messages for the next connection.
fn discard_pending(outgoing_rx: &mut mpsc::UnboundedReceiver<Message>) -> usize {
    outgoing_rx.close();
    let mut lost = 0;
    while outgoing_rx.try_recv().is_ok() {
        lost += 1;
    }
    lost
}

/// A live WebSocket connection. Writes go through a dedicated writer task.
struct WsTransport {
    outgoing_tx: mpsc::UnboundedSender<Message>,
    read: SplitStream<WsStream>,
}

#[async_trait]
impl Transport for WsTransport {
    fn send(&mut self, envelope: Envelope) -> Result<(), WsError> {
        let text =
            serde_json::to_string(&envelope).map_err(|e| WsError::Transport(e.to_string()))?;
        self.outgoing_tx
            .send(Message::Text(text.into()))
            .map_err(|_e| WsError::Transport("writer task has terminated".to_owned()))
    }

    async fn recv(&mut self) -> TransportEvent {
        loop {
            let parsed = match self.read.next().await {
                Some(Ok(Message::Text(text))) => serde_json::from_str::<Envelope>(text.as_str()),
                Some(Ok(Message::Binary(bytes))) => serde_json::from_slice::<Envelope>(&bytes),
                Some(Ok(Message::Close(frame))) => {
                    return TransportEvent::Closed(close_reason(frame));
                }
                Some(Ok(_)) => {
                    // Protocol-level PING/PONG frames are answered by tungstenite.
                    continue;
                }
                Some(Err(e)) => {
                    return TransportEvent::Closed(DisconnectReason::TransportError(e.to_string()));
                }
                None => return TransportEvent::Closed(DisconnectReason::TransportClose),
            };

            match parsed {
                Ok(envelope) => return TransportEvent::Message(envelope),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "Failed to parse WebSocket message");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        }
    }

    fn close(&mut self) {
        _ = self.outgoing_tx.send(Message::Close(None));
    }
}

fn close_reason(frame: Option<CloseFrame>) -> DisconnectReason {
    match frame {
        Some(frame) if frame.code == CloseCode::Policy => {
            DisconnectReason::Rejected(frame.reason.to_string())
        }
        Some(frame) => DisconnectReason::ServerClose {
            code: Some(u16::from(frame.code)),
            reason: frame.reason.to_string(),
        },
        None => DisconnectReason::ServerClose {
            code: None,
            reason: String::new(),
        },
    }
}
