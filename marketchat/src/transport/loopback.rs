//! Loopback transport for testing.
//!
//! [`LoopbackConnector::create`] returns a connector plus a
//! [`LoopbackServer`] handle that plays the server side: it pushes events to
//! the current connection, records every published frame and every
//! credential presented, drops the connection on demand, and can be told to
//! fail or stall upcoming connects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use marketchat_proto::event::{ClientEvent, ServerEvent};

use super::{Connector, Credential, Socket, TransportError, TransportType};

struct Link {
    id: u64,
    to_client: mpsc::UnboundedSender<ServerEvent>,
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct ServerState {
    link: Option<Link>,
    next_link: u64,
    credentials: Vec<Credential>,
    published: Vec<ClientEvent>,
    fail_connects: usize,
    reject_auth: Option<String>,
    stall_handshake: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<ServerState>,
    published_changed: Notify,
}

/// Connector side of the loopback pair.
#[derive(Clone)]
pub struct LoopbackConnector {
    shared: Arc<Shared>,
}

/// Server side of the loopback pair.
#[derive(Clone)]
pub struct LoopbackServer {
    shared: Arc<Shared>,
}

impl LoopbackConnector {
    /// Create a connected connector/server pair.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use marketchat::transport::loopback::LoopbackConnector;
    /// use marketchat::transport::{Connector, Credential, Socket};
    /// use marketchat_proto::ids::UserId;
    ///
    /// # async fn example() {
    /// let (connector, server) = LoopbackConnector::create();
    /// let socket = connector
    ///     .connect(&Credential::new(UserId::new("buyer-1"), "token"))
    ///     .await
    ///     .unwrap();
    /// assert!(socket.is_connected());
    /// assert_eq!(server.connect_count(), 1);
    /// # }
    /// ```
    #[must_use]
    pub fn create() -> (Self, LoopbackServer) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            LoopbackServer { shared },
        )
    }
}

impl Connector for LoopbackConnector {
    type Socket = LoopbackSocket;

    async fn connect(&self, credential: &Credential) -> Result<LoopbackSocket, TransportError> {
        let stall = {
            let mut state = self.shared.state.lock();
            state.credentials.push(credential.clone());
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(TransportError::Unreachable("loopback".into()));
            }
            if let Some(reason) = state.reject_auth.clone() {
                return Err(TransportError::AuthRejected(reason));
            }
            state.stall_handshake
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let mut state = self.shared.state.lock();
        state.next_link += 1;
        let id = state.next_link;
        if let Some(old) = state.link.replace(Link {
            id,
            to_client: tx,
            alive: Arc::clone(&alive),
        }) {
            old.alive.store(false, Ordering::Relaxed);
        }
        drop(state);

        tracing::debug!(link = id, "loopback connection established");
        Ok(LoopbackSocket {
            id,
            shared: Arc::clone(&self.shared),
            incoming: tokio::sync::Mutex::new(rx),
            alive,
        })
    }
}

/// Client end of a loopback connection.
pub struct LoopbackSocket {
    id: u64,
    shared: Arc<Shared>,
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEvent>>,
    alive: Arc<AtomicBool>,
}

impl Socket for LoopbackSocket {
    async fn send(&self, event: &ClientEvent) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        self.shared.state.lock().published.push(event.clone());
        self.shared.published_changed.notify_waiters();
        Ok(())
    }

    async fn recv(&self) -> Result<ServerEvent, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::Relaxed);
        let mut state = self.shared.state.lock();
        if state.link.as_ref().is_some_and(|link| link.id == self.id) {
            state.link = None;
        }
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}

impl LoopbackServer {
    /// Push an event to the current connection.
    ///
    /// Returns `false` if no connection is open.
    pub fn push(&self, event: ServerEvent) -> bool {
        let state = self.shared.state.lock();
        match &state.link {
            Some(link) if link.alive.load(Ordering::Relaxed) => link.to_client.send(event).is_ok(),
            _ => false,
        }
    }

    /// Drop the current connection as if the network went away.
    ///
    /// Events already pushed are still delivered before the client observes
    /// the close.
    pub fn drop_connection(&self) -> bool {
        let Some(link) = self.shared.state.lock().link.take() else {
            return false;
        };
        link.alive.store(false, Ordering::Relaxed);
        tracing::debug!(link = link.id, "loopback connection dropped by server");
        true
    }

    /// Whether a client connection is currently open.
    #[must_use]
    pub fn is_client_connected(&self) -> bool {
        self.shared
            .state
            .lock()
            .link
            .as_ref()
            .is_some_and(|link| link.alive.load(Ordering::Relaxed))
    }

    /// Make the next `n` connect attempts fail as unreachable.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.state.lock().fail_connects = n;
    }

    /// Reject every connect with `reason` until cleared with `None`.
    pub fn reject_auth(&self, reason: Option<String>) {
        self.shared.state.lock().reject_auth = reason;
    }

    /// Make connects hang forever (handshake never acknowledged).
    pub fn stall_handshake(&self, stall: bool) {
        self.shared.state.lock().stall_handshake = stall;
    }

    /// Number of connect attempts seen, successful or not.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.shared.state.lock().credentials.len()
    }

    /// Tokens presented on each connect attempt, oldest first.
    #[must_use]
    pub fn presented_tokens(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .credentials
            .iter()
            .map(|c| c.token.expose().to_string())
            .collect()
    }

    /// Every frame published by the client so far.
    #[must_use]
    pub fn published(&self) -> Vec<ClientEvent> {
        self.shared.state.lock().published.clone()
    }

    /// Forget recorded frames.
    pub fn clear_published(&self) {
        self.shared.state.lock().published.clear();
    }

    /// Wait until the recorded frames satisfy `predicate`.
    pub async fn wait_for_published<F>(&self, predicate: F)
    where
        F: Fn(&[ClientEvent]) -> bool,
    {
        loop {
            let notified = self.shared.published_changed.notified();
            if predicate(&self.published()) {
                return;
            }
            notified.await;
        }
    }
}
