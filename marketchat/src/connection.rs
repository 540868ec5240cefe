//! Transport connection manager.
//!
//! Owns the single persistent connection of a session and exposes a
//! publish/subscribe surface over it.
//!
//! - [`ConnectionManager::connect`] is idempotent and serialized: concurrent
//!   callers share one handshake. Every successful connect bumps the
//!   connection *epoch* and re-reads the credential.
//! - When the socket is lost, all subscriptions are dropped and
//!   [`ConnectionEvent::Disconnected`] is broadcast. Dependents re-subscribe
//!   on every [`ConnectionEvent::Connected`], which rules out duplicate
//!   handlers after a reconnect.
//! - A singleton supervisor reconnects with exponential backoff and jitter.
//! - Only [`ConnectionManager::disconnect`] (logout) closes the connection
//!   on purpose.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use marketchat_proto::event::{ClientEvent, EventName, ServerEvent};

use crate::transport::{Connector, CredentialSource, Socket, TransportError};

/// Capacity of the connection event broadcast channel.
const EVENT_CAPACITY: usize = 64;

/// Reconnection backoff settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound for the backoff delay (before jitter).
    pub max_delay: Duration,
    /// Attempts before the supervisor gives up.
    pub max_attempts: u32,
    /// Consecutive failures after which connectivity is reported as degraded.
    pub degraded_after: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            degraded_after: 3,
        }
    }
}

impl ReconnectConfig {
    /// Backoff before attempt number `attempt` (1-based).
    ///
    /// Doubles from `initial_delay` up to `max_delay`, then adds up to 25%
    /// random jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay);
        let jitter_cap = u64::try_from(base.as_millis() / 4).unwrap_or(u64::MAX);
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_cap)
        };
        base + Duration::from_millis(jitter)
    }
}

/// Connection manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Upper bound for connect + authenticate.
    pub handshake_timeout: Duration,
    /// Reconnect supervisor settings.
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(20),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Coarse connection state for UI indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// No connection and none being attempted.
    Offline,
    /// A connect or reconnect is in progress.
    Connecting,
    /// Authenticated and live.
    Connected,
    /// Repeated failures; still retrying or waiting for a manual retry.
    Degraded,
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "offline"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Degraded => write!(f, "connecting (degraded)"),
        }
    }
}

/// Lifecycle notifications broadcast by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection was established; subscriptions must be (re)made.
    Connected {
        /// Epoch of the new connection.
        epoch: u64,
    },
    /// The connection of `epoch` is gone and its subscriptions were dropped.
    Disconnected {
        /// Epoch of the lost connection.
        epoch: u64,
    },
    /// The supervisor is about to retry.
    Reconnecting {
        /// 1-based attempt number.
        attempt: u32,
        /// Backoff before the attempt.
        delay: Duration,
    },
    /// The supervisor gave up; only a manual retry reconnects.
    ReconnectFailed {
        /// Attempts made.
        attempts: u32,
    },
    /// The server rejected the credential.
    AuthRejected {
        /// Server-provided reason.
        reason: String,
    },
}

/// Handle returned by [`ConnectionManager::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Callback invoked for every inbound event of the subscribed name.
///
/// Runs on the connection's reader task; it must not block.
pub type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

struct LinkState<S> {
    socket: Option<Arc<S>>,
    reader: Option<JoinHandle<()>>,
    epoch: u64,
    auto_reconnect: bool,
    supervising: bool,
    consecutive_failures: u32,
}

impl<S: Socket> LinkState<S> {
    fn live_socket(&self) -> Option<&Arc<S>> {
        self.socket.as_ref().filter(|s| s.is_connected())
    }
}

struct Inner<C: Connector> {
    connector: C,
    credentials: Arc<dyn CredentialSource>,
    config: ConnectionConfig,
    connect_lock: tokio::sync::Mutex<()>,
    link: parking_lot::Mutex<LinkState<C::Socket>>,
    handlers: parking_lot::Mutex<BTreeMap<SubscriptionId, (EventName, Handler)>>,
    next_subscription: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
    connectivity: watch::Sender<Connectivity>,
    wake_supervisor: mpsc::UnboundedSender<()>,
}

/// Shared owner of the session's persistent connection.
///
/// Cheap to clone; all clones drive the same connection.
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Creates a manager. Nothing is dialled until [`connect`](Self::connect).
    ///
    /// Spawns the reconnect supervisor, so it must be called within a Tokio
    /// runtime. The supervisor exits when the last clone is dropped.
    pub fn new(
        connector: C,
        credentials: Arc<dyn CredentialSource>,
        config: ConnectionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (connectivity, _) = watch::channel(Connectivity::Offline);
        let (wake_supervisor, wake_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            connector,
            credentials,
            config,
            connect_lock: tokio::sync::Mutex::new(()),
            link: parking_lot::Mutex::new(LinkState {
                socket: None,
                reader: None,
                epoch: 0,
                auto_reconnect: false,
                supervising: false,
                consecutive_failures: 0,
            }),
            handlers: parking_lot::Mutex::new(BTreeMap::new()),
            next_subscription: AtomicU64::new(1),
            events,
            connectivity,
            wake_supervisor,
        });
        tokio::spawn(supervise(Arc::downgrade(&inner), wake_rx));
        Self { inner }
    }

    /// Connect if not already connected, returning the live epoch.
    ///
    /// Tears down a stale socket first, re-reads the credential, and waits
    /// for the server's acknowledgment (bounded by the handshake timeout).
    /// The user is announced online once authenticated.
    ///
    /// # Errors
    ///
    /// - [`TransportError::NoCredential`] if signed out.
    /// - [`TransportError::Timeout`] if the handshake exceeds the timeout.
    /// - Any error of the underlying connector.
    pub async fn connect(&self) -> Result<u64, TransportError> {
        let _guard = self.inner.connect_lock.lock().await;
        self.inner.connect_locked().await
    }

    /// Manual retry, e.g. from a "reconnect now" button.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn retry_now(&self) -> Result<u64, TransportError> {
        tracing::info!("manual reconnect requested");
        self.connect().await
    }

    /// Replace the live connection with one authenticated by the current
    /// credential (after a token refresh).
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn refresh_auth(&self) -> Result<u64, TransportError> {
        let _guard = self.inner.connect_lock.lock().await;
        self.inner.detach().await;
        self.inner.connect_locked().await
    }

    /// Close the connection on purpose (logout) and stop reconnecting.
    pub async fn disconnect(&self) {
        let _guard = self.inner.connect_lock.lock().await;
        self.inner.link.lock().auto_reconnect = false;
        self.inner.detach().await;
        self.inner.handlers.lock().clear();
        self.inner.set_connectivity(Connectivity::Offline);
        tracing::info!("disconnected");
    }

    /// Send one event over the live connection.
    ///
    /// Never queues: without a live connection the event is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] when there is no live
    /// connection, or the socket's send error.
    pub async fn publish(&self, event: &ClientEvent) -> Result<(), TransportError> {
        let socket = self.inner.link.lock().live_socket().cloned();
        let Some(socket) = socket else {
            tracing::warn!(event = event.name(), "publish while not connected, dropping");
            return Err(TransportError::NotConnected);
        };
        socket.send(event).await.inspect_err(|e| {
            tracing::warn!(event = event.name(), err = %e, "publish failed");
        })
    }

    /// Register `handler` for inbound events named `name`.
    ///
    /// The registration lasts until [`unsubscribe`](Self::unsubscribe) or
    /// until the current connection is lost, whichever comes first.
    pub fn subscribe<F>(&self, name: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .lock()
            .insert(id, (name, Arc::new(handler)));
        tracing::trace!(event = %name, ?id, "subscribed");
        id
    }

    /// Remove a registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.handlers.lock().remove(&id).is_some()
    }

    /// Number of live registrations.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// Epoch of the most recent successful connect (0 before the first).
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.inner.link.lock().epoch
    }

    /// Whether a live connection exists.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().live_socket().is_some()
    }

    /// Watch the coarse connectivity state.
    #[must_use]
    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.inner.connectivity.subscribe()
    }

    /// Subscribe to lifecycle notifications.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }
}

impl<C: Connector> Inner<C> {
    async fn connect_locked(self: &Arc<Self>) -> Result<u64, TransportError> {
        let live = {
            let link = self.link.lock();
            link.live_socket().map(|_| link.epoch)
        };
        if let Some(epoch) = live {
            return Ok(epoch);
        }
        self.detach().await;

        let Some(credential) = self.credentials.credential() else {
            let err = TransportError::NoCredential;
            self.record_failure(&err);
            return Err(err);
        };

        if *self.connectivity.borrow() == Connectivity::Offline {
            self.set_connectivity(Connectivity::Connecting);
        }
        tracing::debug!(user_id = %credential.user_id, "connecting");

        let socket = match tokio::time::timeout(
            self.config.handshake_timeout,
            self.connector.connect(&credential),
        )
        .await
        {
            Ok(Ok(socket)) => Arc::new(socket),
            Ok(Err(e)) => {
                self.record_failure(&e);
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.handshake_timeout.as_millis(),
                    "handshake timed out"
                );
                let err = TransportError::Timeout;
                self.record_failure(&err);
                return Err(err);
            }
        };

        let online = ClientEvent::UserOnline {
            user_id: credential.user_id.clone(),
        };
        if let Err(e) = socket.send(&online).await {
            tracing::warn!(err = %e, "failed to announce user online");
        }

        let epoch = {
            let mut link = self.link.lock();
            link.epoch += 1;
            let epoch = link.epoch;
            link.socket = Some(Arc::clone(&socket));
            link.reader = Some(tokio::spawn(reader_loop(
                Arc::downgrade(self),
                socket,
                epoch,
            )));
            link.auto_reconnect = true;
            link.consecutive_failures = 0;
            epoch
        };

        self.set_connectivity(Connectivity::Connected);
        let _ = self.events.send(ConnectionEvent::Connected { epoch });
        tracing::info!(epoch, "connected");
        Ok(epoch)
    }

    /// Removes the current socket (if any), dropping its subscriptions.
    async fn detach(&self) {
        let (socket, reader, epoch) = {
            let mut link = self.link.lock();
            (link.socket.take(), link.reader.take(), link.epoch)
        };
        if let Some(reader) = reader {
            reader.abort();
        }
        let Some(socket) = socket else {
            return;
        };
        self.handlers.lock().clear();
        socket.close().await;
        let _ = self.events.send(ConnectionEvent::Disconnected { epoch });
        tracing::debug!(epoch, "socket detached");
    }

    fn record_failure(&self, err: &TransportError) {
        let (failures, supervising) = {
            let mut link = self.link.lock();
            link.consecutive_failures += 1;
            (link.consecutive_failures, link.supervising)
        };
        tracing::warn!(failures, err = %err, "connect failed");
        if let TransportError::AuthRejected(reason) = err {
            let _ = self.events.send(ConnectionEvent::AuthRejected {
                reason: reason.clone(),
            });
        }
        let next = if failures >= self.config.reconnect.degraded_after {
            Connectivity::Degraded
        } else if supervising {
            Connectivity::Connecting
        } else {
            Connectivity::Offline
        };
        self.set_connectivity(next);
    }

    fn set_connectivity(&self, next: Connectivity) {
        self.connectivity.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                tracing::debug!(from = %current, to = %next, "connectivity changed");
                *current = next;
                true
            }
        });
    }

    fn dispatch(&self, event: &ServerEvent) {
        let name = event.name();
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .values()
            .filter(|(n, _)| *n == name)
            .map(|(_, h)| Arc::clone(h))
            .collect();
        if handlers.is_empty() {
            tracing::trace!(event = %name, "no subscribers");
        }
        for handler in handlers {
            handler(event);
        }
    }

    /// Called by the reader task of `epoch` when its socket fails.
    async fn handle_loss(&self, epoch: u64) {
        let (socket, auto_reconnect) = {
            let mut link = self.link.lock();
            if link.epoch != epoch || link.socket.is_none() {
                return;
            }
            link.reader = None;
            (link.socket.take(), link.auto_reconnect)
        };
        self.handlers.lock().clear();
        if let Some(socket) = socket {
            socket.close().await;
        }
        tracing::warn!(epoch, "connection lost");
        let _ = self.events.send(ConnectionEvent::Disconnected { epoch });

        if !auto_reconnect {
            self.set_connectivity(Connectivity::Offline);
            return;
        }
        self.set_connectivity(Connectivity::Connecting);
        let _ = self.wake_supervisor.send(());
    }

    /// Reconnects with backoff until live again, disabled, or out of attempts.
    async fn reconnect_until_live(self: &Arc<Self>) {
        let config = self.config.reconnect.clone();
        let mut attempt: u32 = 0;
        loop {
            {
                let mut link = self.link.lock();
                if link.live_socket().is_some() || !link.auto_reconnect {
                    link.supervising = false;
                    return;
                }
                link.supervising = true;
            }
            if attempt >= config.max_attempts {
                tracing::warn!(attempts = attempt, "giving up on reconnect");
                self.link.lock().supervising = false;
                self.set_connectivity(Connectivity::Degraded);
                let _ = self
                    .events
                    .send(ConnectionEvent::ReconnectFailed { attempts: attempt });
                return;
            }
            attempt += 1;
            let delay = config.delay_for(attempt);
            tracing::info!(attempt, delay_ms = delay.as_millis(), "reconnecting");
            let _ = self
                .events
                .send(ConnectionEvent::Reconnecting { attempt, delay });
            tokio::time::sleep(delay).await;

            let _guard = self.connect_lock.lock().await;
            if !self.link.lock().auto_reconnect {
                continue;
            }
            if self.connect_locked().await.is_ok() {
                attempt = 0;
            }
        }
    }
}

/// Reads events from one socket and dispatches them until it fails.
async fn reader_loop<C: Connector>(inner: Weak<Inner<C>>, socket: Arc<C::Socket>, epoch: u64) {
    loop {
        match socket.recv().await {
            Ok(event) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.dispatch(&event);
            }
            Err(e) => {
                tracing::info!(epoch, err = %e, "socket closed");
                break;
            }
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.handle_loss(epoch).await;
    }
}

/// Singleton reconnect supervisor; woken after every unexpected loss.
async fn supervise<C: Connector>(inner: Weak<Inner<C>>, mut wake: mpsc::UnboundedReceiver<()>) {
    while wake.recv().await.is_some() {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.reconnect_until_live().await;
    }
}
