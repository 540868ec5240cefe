//! WebSocket transport.
//!
//! Every frame is a JSON text message (see [`marketchat_proto::codec`]).
//! [`WsConnector::connect`] performs the handshake: it opens the socket,
//! sends `authenticate` as the first frame, and waits for `authenticated`.
//! A background reader task then decodes frames into a channel; malformed or
//! unknown frames are logged and skipped without dropping the connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use marketchat_proto::codec::{self, CodecError};
use marketchat_proto::event::{ClientEvent, ServerEvent};

use super::{Connector, Credential, Socket, TransportError, TransportType};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Timeout for the TCP/TLS connect and HTTP upgrade.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the decoded-event channel between reader task and socket.
const INCOMING_CAPACITY: usize = 256;

/// Opens authenticated WebSocket connections to one server URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: url::Url,
}

impl WsConnector {
    /// Creates a connector for `socket_url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the URL does not parse or
    /// its scheme is not `ws`/`wss`.
    pub fn new(socket_url: &str) -> Result<Self, TransportError> {
        let url = url::Url::parse(socket_url)
            .map_err(|_| TransportError::InvalidUrl(socket_url.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUrl(socket_url.to_string()));
        }
        Ok(Self { url })
    }

    /// The server URL this connector dials.
    #[must_use]
    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

impl Connector for WsConnector {
    type Socket = WsSocket;

    /// Connect and authenticate.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the WebSocket upgrade times out.
    /// - [`TransportError::Unreachable`] if the server refuses the connection.
    /// - [`TransportError::AuthRejected`] if the server answers `auth_error`.
    /// - [`TransportError::ConnectionClosed`] if the server hangs up mid-handshake.
    async fn connect(&self, credential: &Credential) -> Result<WsSocket, TransportError> {
        let url = self.url.as_str();
        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
            .await
            .map_err(|_| {
                tracing::warn!(url, "WebSocket connect timed out");
                TransportError::Timeout
            })?
            .map_err(|e| {
                tracing::warn!(url, err = %e, "WebSocket connect failed");
                map_ws_connect_error(url, e)
            })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let authenticate = codec::encode_client(&ClientEvent::Authenticate {
            token: credential.token.clone(),
        })?;
        ws_sender
            .send(Message::text(authenticate))
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "failed to send authenticate frame");
                TransportError::Io(std::io::Error::other(format!(
                    "failed to send authenticate: {e}"
                )))
            })?;

        await_authenticated(&mut ws_reader, credential).await?;

        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&connected)));

        Ok(WsSocket {
            ws_sender: Mutex::new(ws_sender),
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }
}

/// Reads frames until the server acknowledges or rejects the credential.
async fn await_authenticated(
    ws_reader: &mut WsReader,
    credential: &Credential,
) -> Result<(), TransportError> {
    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match codec::decode_server(text.as_str()) {
                Ok(ServerEvent::Authenticated { user_id }) => {
                    if user_id != credential.user_id {
                        tracing::warn!(
                            expected = %credential.user_id,
                            actual = %user_id,
                            "server authenticated a different user id"
                        );
                    }
                    tracing::info!(user_id = %user_id, "socket authenticated");
                    return Ok(());
                }
                Ok(ServerEvent::AuthError { reason }) => {
                    tracing::warn!(reason = %reason, "socket authentication rejected");
                    return Err(TransportError::AuthRejected(reason));
                }
                Ok(other) => {
                    tracing::debug!(event = %other.name(), "event before authentication, skipping");
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed frame during handshake, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::warn!("server closed connection during handshake");
                return Err(TransportError::ConnectionClosed);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket error during handshake");
                return Err(TransportError::Io(std::io::Error::other(format!(
                    "WebSocket error during handshake: {e}"
                ))));
            }
        }
    }
    tracing::warn!("WebSocket stream ended during handshake");
    Err(TransportError::ConnectionClosed)
}

/// Authenticated WebSocket connection.
pub struct WsSocket {
    ws_sender: Mutex<WsSender>,
    incoming: Mutex<mpsc::Receiver<ServerEvent>>,
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl Socket for WsSocket {
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        let text = codec::encode_client(event)?;
        let mut sender = self.ws_sender.lock().await;
        sender.send(Message::text(text)).await.map_err(|e| {
            tracing::warn!(err = %e, event = event.name(), "WebSocket send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    async fn recv(&self) -> Result<ServerEvent, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let mut sender = self.ws_sender.lock().await;
        if let Err(e) = sender.close().await {
            tracing::debug!(err = %e, "WebSocket close failed");
        }
        self.reader_handle.abort();
    }

    fn transport_type(&self) -> TransportType {
        TransportType::WebSocket
    }
}

impl Drop for WsSocket {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Background task that decodes incoming frames.
///
/// Malformed and unknown frames are logged and skipped; the task does not
/// disconnect on bad data. Sets `connected` to `false` when the WebSocket
/// closes or errors out.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<ServerEvent>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match codec::decode_server(text.as_str()) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(CodecError::UnknownEvent(name)) => {
                    tracing::debug!(event = %name, "unknown event, skipping");
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed frame, skipping");
                }
            },
            Ok(Message::Binary(data)) => {
                tracing::warn!(len = data.len(), "unexpected binary frame, skipping");
            }
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket closed by server");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::info!("socket reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(url.to_string())
            } else {
                TransportError::Io(io_err)
            }
        }
        WsError::Tls(_) => TransportError::Io(std::io::Error::other(format!("TLS error: {err}"))),
        WsError::Http(response) => TransportError::Io(std::io::Error::other(format!(
            "socket HTTP error: status {}",
            response.status()
        ))),
        other => TransportError::Io(std::io::Error::other(format!(
            "socket connection error: {other}"
        ))),
    }
}
