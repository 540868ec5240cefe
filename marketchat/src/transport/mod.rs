//! Transport layer abstraction for `MarketChat`.
//!
//! A [`Connector`] opens one authenticated [`Socket`] per call. Concrete
//! implementations:
//! - [`loopback::LoopbackConnector`]: in-process channels with a server-side
//!   control handle, for tests
//! - [`websocket::WsConnector`]: JSON text frames over WebSocket
//!
//! Connection lifetime, epochs and reconnects live one layer up in
//! [`crate::connection::ConnectionManager`].

pub mod loopback;
pub mod websocket;

use std::fmt;
use std::sync::Arc;

use marketchat_proto::codec::CodecError;
use marketchat_proto::event::{AuthToken, ClientEvent, ServerEvent};
use marketchat_proto::ids::UserId;

/// Describes which kind of transport is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// WebSocket connection to the messaging server.
    WebSocket,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "WebSocket"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// There is no live connection; nothing was sent.
    #[error("not connected")]
    NotConnected,

    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The server could not be reached.
    #[error("server {0} is unreachable")]
    Unreachable(String),

    /// The socket URL is not a usable `ws://` or `wss://` URL.
    #[error("invalid socket url {0:?}")]
    InvalidUrl(String),

    /// The server rejected the credential.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// No credential is available (signed out).
    #[error("no credential available")]
    NoCredential,

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity and bearer token used to authenticate a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    /// The signed-in user.
    pub user_id: UserId,
    /// Bearer token; `Debug` output is redacted.
    pub token: AuthToken,
}

impl Credential {
    /// Creates a credential.
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: AuthToken::new(token),
        }
    }
}

/// Supplies the current credential.
///
/// Read on every connect, reconnect and REST call, so a refreshed token is
/// picked up without rebuilding anything.
pub trait CredentialSource: Send + Sync {
    /// The current credential, or `None` when signed out.
    fn credential(&self) -> Option<Credential>;
}

/// A credential slot that can be replaced at runtime (token refresh, logout).
#[derive(Debug, Clone, Default)]
pub struct SharedCredential {
    slot: Arc<parking_lot::RwLock<Option<Credential>>>,
}

impl SharedCredential {
    /// Creates a slot holding `credential`.
    #[must_use]
    pub fn new(credential: Credential) -> Self {
        Self {
            slot: Arc::new(parking_lot::RwLock::new(Some(credential))),
        }
    }

    /// Replaces the stored credential.
    pub fn set(&self, credential: Credential) {
        *self.slot.write() = Some(credential);
    }

    /// Removes the stored credential.
    pub fn clear(&self) {
        *self.slot.write() = None;
    }
}

impl CredentialSource for SharedCredential {
    fn credential(&self) -> Option<Credential> {
        self.slot.read().clone()
    }
}

/// One authenticated, bidirectional event stream.
///
/// Frames are typed; encoding is the implementation's concern.
pub trait Socket: Send + Sync + 'static {
    /// Send one client event.
    ///
    /// Returns `Ok(())` once the frame has been handed to the underlying
    /// connection. This does NOT guarantee the server processed it.
    fn send(
        &self,
        event: &ClientEvent,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next server event.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the connection is gone.
    fn recv(&self) -> impl std::future::Future<Output = Result<ServerEvent, TransportError>> + Send;

    /// Whether the connection is still believed to be alive.
    fn is_connected(&self) -> bool;

    /// Close the connection. Idempotent.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}

/// Opens authenticated sockets.
pub trait Connector: Send + Sync + 'static {
    /// Socket type produced by this connector.
    type Socket: Socket;

    /// Open a connection and complete the authentication handshake.
    ///
    /// Resolves only after the server has acknowledged the credential.
    fn connect(
        &self,
        credential: &Credential,
    ) -> impl std::future::Future<Output = Result<Self::Socket, TransportError>> + Send;
}
