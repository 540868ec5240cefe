//! Chat session: the sync engine for one signed-in user.
//!
//! [`ChatSession`] owns one instance of every component (conversation
//! store, message threads, delivery tracker, presence) and drives them from
//! two sources: calls made by the UI, and inbound transport events. Inbound
//! events are funnelled through a single dispatch task, so they are applied
//! in arrival order. The UI is notified through [`ChatEvent`]s on a bounded
//! channel.
//!
//! Send pipeline: validate -> optimistic entry (`Pending` -> `Sent`) ->
//! REST send in the background -> confirm (and upgrade a provisional
//! conversation) or, after the grace delay, `Failed`.

pub mod reasons;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};

use marketchat_proto::event::{ClientEvent, EventName, ServerEvent};
use marketchat_proto::ids::{
    ClientMessageId, ConversationId, ConversationKey, KeyError, Timestamp, UserId,
};
use marketchat_proto::message::{Draft, ValidationError};
use marketchat_proto::rest::{ConversationMessageDto, Role, SendMessageRequest};
use marketchat_proto::typing::TypingPhase;

use crate::api::{ApiError, ChatApi};
use crate::connection::{ConnectionEvent, ConnectionManager, Connectivity, SubscriptionId};
use crate::sync::Message;
use crate::sync::conversations::{
    Conversation, ConversationPatch, ConversationStore, LastMessage, PatchOutcome, SearchOutcome,
};
use crate::sync::delivery::{DeliveryError, DeliveryStatus, DeliveryTracker, OutgoingSend};
use crate::sync::presence::{PresenceTracker, TypingNotifier};
use crate::sync::threads::MessageThreads;
use crate::transport::{Connector, TransportError};

/// Inbound events the session subscribes to on every connection.
const SUBSCRIBED_EVENTS: [EventName; 5] = [
    EventName::NewMessage,
    EventName::MessageNotification,
    EventName::PresenceUpdate,
    EventName::TypingStart,
    EventName::TypingStop,
];

/// Tunables of a chat session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// Delay between a rejected send and showing it as failed.
    pub failure_grace: Duration,
    /// Debounce of conversation search.
    pub search_debounce: Duration,
    /// Capacity of the [`ChatEvent`] channel.
    pub event_buffer: usize,
    /// Local typing burst ends after this much idle time.
    pub typing_idle: Duration,
    /// Remote typing marks expire after this long without a stop.
    pub typing_expiry: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            failure_grace: Duration::from_millis(1500),
            search_debounce: Duration::from_millis(300),
            event_buffer: 64,
            typing_idle: Duration::from_secs(2),
            typing_expiry: Duration::from_secs(5),
        }
    }
}

/// Errors returned by [`ChatSession`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The draft or recipient was rejected before anything was sent.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// A conversation key could not be parsed.
    #[error("invalid conversation key: {0}")]
    Key(#[from] KeyError),

    /// A REST call failed.
    #[error("request failed: {0}")]
    Api(#[from] ApiError),

    /// The persistent connection failed.
    #[error("connection failed: {0}")]
    Transport(#[from] TransportError),

    /// A retry or discard was not allowed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// The operation needs an open conversation.
    #[error("no conversation is open")]
    NoOpenConversation,

    /// The other participant of the conversation is not known yet.
    #[error("counterparty of {0} is unknown")]
    UnknownCounterparty(ConversationKey),
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// The message sequence of a conversation changed.
    ThreadUpdated {
        /// Affected conversation.
        key: ConversationKey,
    },
    /// A local message changed delivery status.
    StatusChanged {
        /// Conversation of the message.
        key: ConversationKey,
        /// Local id of the message.
        client_id: ClientMessageId,
        /// New status.
        status: DeliveryStatus,
    },
    /// A send was rejected and is now shown as failed.
    SendFailed {
        /// Local id of the message.
        client_id: ClientMessageId,
        /// Human-readable reason.
        reason: String,
    },
    /// A provisional conversation received its server id.
    ConversationUpgraded {
        /// The provisional key.
        from: ConversationKey,
        /// The durable key.
        to: ConversationKey,
    },
    /// The conversation list or its unread counters changed.
    ConversationsChanged {
        /// Sum of all unread counters.
        total_unread: u32,
    },
    /// A list or history fetch failed; the previous data is still shown.
    LoadFailed {
        /// Conversation whose history failed, `None` for the list.
        key: Option<ConversationKey>,
        /// Human-readable reason.
        reason: String,
    },
    /// A user came online or went offline.
    PresenceChanged {
        /// The user.
        user_id: UserId,
        /// New state.
        online: bool,
    },
    /// Presence and typing state was dropped with the connection.
    PresenceCleared,
    /// A user started or stopped typing toward the current user.
    TypingChanged {
        /// The user.
        user_id: UserId,
        /// Whether they are typing now.
        typing: bool,
    },
    /// Coarse connection state changed.
    Connectivity(Connectivity),
    /// Connection lifecycle notification.
    Connection(ConnectionEvent),
}

/// Handle to a message handed to [`ChatSession::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTicket {
    /// Local id of the message; stable across retries.
    pub client_id: ClientMessageId,
    /// Conversation the message was sent in (may later be upgraded).
    pub conversation: ConversationKey,
}

/// Background refresh kinds, each coalesced to one in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Refresh {
    OpenThread,
    ConversationList,
}

#[derive(Debug, Default)]
struct RefreshGate {
    running: bool,
    dirty: bool,
}

#[derive(Default)]
struct SessionState {
    threads: MessageThreads,
    delivery: DeliveryTracker,
    open: Option<ConversationKey>,
    bound_epoch: u64,
    subscriptions: Vec<SubscriptionId>,
}

struct SessionInner<A: ChatApi, C: Connector> {
    me: UserId,
    api: Arc<A>,
    connection: ConnectionManager<C>,
    config: ChatConfig,
    store: ConversationStore<A>,
    presence: PresenceTracker,
    typing: TypingNotifier<C>,
    state: Mutex<SessionState>,
    open_generation: AtomicU64,
    refresh: Mutex<HashMap<Refresh, RefreshGate>>,
    events: mpsc::Sender<ChatEvent>,
    inbound: mpsc::UnboundedSender<ServerEvent>,
}

/// Sync engine for one signed-in user. Cheap to clone.
pub struct ChatSession<A: ChatApi, C: Connector> {
    inner: Arc<SessionInner<A, C>>,
}

impl<A: ChatApi, C: Connector> Clone for ChatSession<A, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: ChatApi, C: Connector> ChatSession<A, C> {
    /// Creates a session for `me` on top of a REST client and the shared
    /// connection.
    ///
    /// Returns the session and the receiver for [`ChatEvent`]s. Spawns the
    /// inbound dispatch task and the connection watcher, so it must be
    /// called within a Tokio runtime.
    pub fn new(
        me: UserId,
        api: Arc<A>,
        connection: ConnectionManager<C>,
        config: ChatConfig,
    ) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (events, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let connection_events = connection.events();
        let connectivity = connection.connectivity();
        let inner = Arc::new(SessionInner {
            store: ConversationStore::new(Arc::clone(&api), config.search_debounce),
            presence: PresenceTracker::new(config.typing_expiry),
            typing: TypingNotifier::new(connection.clone(), config.typing_idle),
            me,
            api,
            connection,
            config,
            state: Mutex::new(SessionState::default()),
            open_generation: AtomicU64::new(0),
            refresh: Mutex::new(HashMap::new()),
            events,
            inbound,
        });
        tokio::spawn(dispatch_loop(Arc::downgrade(&inner), inbound_rx));
        tokio::spawn(connection_loop(
            Arc::downgrade(&inner),
            connection_events,
            connectivity,
        ));
        (Self { inner }, events_rx)
    }

    /// The signed-in user.
    #[must_use]
    pub fn me(&self) -> &UserId {
        &self.inner.me
    }

    /// The shared connection.
    #[must_use]
    pub fn connection(&self) -> &ConnectionManager<C> {
        &self.inner.connection
    }

    // --- connection ---

    /// Connect (idempotent) and subscribe to inbound events.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Transport`] if the connection cannot be made;
    /// the supervisor keeps retrying after an unexpected loss only.
    pub async fn connect(&self) -> Result<u64, ChatError> {
        let epoch = self.inner.connection.connect().await?;
        self.bind();
        Ok(epoch)
    }

    /// Manual reconnect ("retry now").
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect).
    pub async fn retry_connection(&self) -> Result<u64, ChatError> {
        let epoch = self.inner.connection.retry_now().await?;
        self.bind();
        Ok(epoch)
    }

    /// Watch the coarse connection state.
    #[must_use]
    pub fn connectivity(&self) -> watch::Receiver<Connectivity> {
        self.inner.connection.connectivity()
    }

    /// Close the connection and forget all session state.
    pub async fn logout(&self) {
        self.inner.typing.blur().await;
        self.inner.connection.disconnect().await;
        self.inner.open_generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.inner.state.lock();
            state.threads.clear();
            state.delivery = DeliveryTracker::new();
            state.open = None;
            state.bound_epoch = 0;
            state.subscriptions.clear();
        }
        self.inner.store.clear();
        self.inner.presence.clear();
        tracing::info!(user_id = %self.inner.me, "logged out");
    }

    // --- conversation list ---

    /// Load the conversation list for `role`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Api`] if the fetch fails; the previous list is
    /// kept and [`ChatEvent::LoadFailed`] is emitted.
    pub async fn load_conversations(&self, role: Role) -> Result<usize, ChatError> {
        match self.inner.store.load(role).await {
            Ok(count) => {
                self.sync_online_flags();
                self.emit_conversations_changed();
                Ok(count)
            }
            Err(e) => {
                self.emit(ChatEvent::LoadFailed {
                    key: None,
                    reason: reasons::describe_load(&e),
                });
                Err(e.into())
            }
        }
    }

    /// Debounced conversation search; an empty query restores the full list.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Api`] if the fetch fails.
    pub async fn search(&self, query: &str) -> Result<SearchOutcome, ChatError> {
        match self.inner.store.search(query).await {
            Ok(SearchOutcome::Applied(count)) => {
                self.sync_online_flags();
                self.emit_conversations_changed();
                Ok(SearchOutcome::Applied(count))
            }
            Ok(SearchOutcome::Superseded) => Ok(SearchOutcome::Superseded),
            Err(e) => {
                self.emit(ChatEvent::LoadFailed {
                    key: None,
                    reason: reasons::describe_load(&e),
                });
                Err(e.into())
            }
        }
    }

    /// Conversation list in display order.
    #[must_use]
    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.store.conversations()
    }

    /// Sum of unread counters.
    #[must_use]
    pub fn total_unread(&self) -> u32 {
        self.inner.store.total_unread()
    }

    // --- open conversation ---

    /// Open a chat with `counterparty`, creating a provisional conversation
    /// if none exists yet.
    ///
    /// # Errors
    ///
    /// [`ChatError::Validation`] when `counterparty` is the current user;
    /// otherwise as [`open`](Self::open).
    pub async fn open_with(
        &self,
        counterparty: &UserId,
        name: &str,
    ) -> Result<ConversationKey, ChatError> {
        if *counterparty == self.inner.me {
            return Err(ValidationError::SelfMessage.into());
        }
        let key = self.inner.store.ensure_provisional(counterparty, name);
        self.open(key.clone()).await?;
        Ok(self.open_key().unwrap_or(key))
    }

    /// Open a conversation by its text key (`new_<uuid>` or a server id).
    ///
    /// # Errors
    ///
    /// [`ChatError::Key`] for a malformed key; otherwise as
    /// [`open`](Self::open).
    pub async fn open_raw(&self, raw: &str) -> Result<ConversationKey, ChatError> {
        let key = ConversationKey::parse(raw)?;
        self.open(key).await?;
        self.open_key().ok_or(ChatError::NoOpenConversation)
    }

    /// Make `key` the open conversation.
    ///
    /// Leaves the previous room, joins the new one, loads its history and
    /// marks it read. Results still in flight for the previous conversation
    /// are dropped when they arrive.
    ///
    /// # Errors
    ///
    /// [`ChatError::Validation`] for a provisional key addressed to the
    /// current user, [`ChatError::Api`] if the history fetch fails (the
    /// conversation stays open).
    pub async fn open(&self, key: ConversationKey) -> Result<(), ChatError> {
        let key = match key {
            ConversationKey::Provisional { counterparty } => {
                if counterparty == self.inner.me {
                    return Err(ValidationError::SelfMessage.into());
                }
                self.inner
                    .store
                    .ensure_provisional(&counterparty, counterparty.as_str())
            }
            durable @ ConversationKey::Durable(_) => durable,
        };

        let previous = {
            let mut state = self.inner.state.lock();
            self.inner.open_generation.fetch_add(1, Ordering::SeqCst);
            state.open.replace(key.clone())
        };
        tracing::debug!(key = %key, "conversation opened");
        self.inner.typing.blur().await;

        if let Some(ConversationKey::Durable(old)) = previous
            && key.durable_id() != Some(&old)
        {
            self.publish_quietly(ClientEvent::LeaveChat {
                conversation_id: old,
            })
            .await;
        }

        if let ConversationKey::Durable(id) = &key {
            self.publish_quietly(ClientEvent::JoinChat {
                conversation_id: id.clone(),
            })
            .await;
            self.refresh_open().await?;
            self.mark_read_in_background(id.clone());
        }
        Ok(())
    }

    /// Close the open conversation, if any.
    pub async fn close(&self) {
        let previous = {
            let mut state = self.inner.state.lock();
            self.inner.open_generation.fetch_add(1, Ordering::SeqCst);
            state.open.take()
        };
        self.inner.typing.blur().await;
        if let Some(ConversationKey::Durable(id)) = previous {
            self.publish_quietly(ClientEvent::LeaveChat {
                conversation_id: id,
            })
            .await;
        }
    }

    /// Key of the open conversation.
    #[must_use]
    pub fn open_key(&self) -> Option<ConversationKey> {
        self.inner.state.lock().open.clone()
    }

    /// Reconciled messages of the open conversation.
    #[must_use]
    pub fn open_thread(&self) -> Vec<Message> {
        let state = self.inner.state.lock();
        state
            .open
            .as_ref()
            .map(|key| state.threads.thread(key).to_vec())
            .unwrap_or_default()
    }

    /// Reconciled messages of any conversation.
    #[must_use]
    pub fn thread(&self, key: &ConversationKey) -> Vec<Message> {
        self.inner.state.lock().threads.thread(key).to_vec()
    }

    /// Refetch the open conversation's history and merge it.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Api`] if the fetch fails.
    pub async fn refresh_open(&self) -> Result<(), ChatError> {
        let (key, generation) = {
            let state = self.inner.state.lock();
            (
                state.open.clone(),
                self.inner.open_generation.load(Ordering::SeqCst),
            )
        };
        let Some(key) = key else {
            return Ok(());
        };
        let Some(conversation_id) = key.durable_id().cloned() else {
            return Ok(());
        };

        let snapshot = match self.inner.api.fetch_messages(&conversation_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "history fetch failed");
                self.emit(ChatEvent::LoadFailed {
                    key: Some(key),
                    reason: reasons::describe_load(&e),
                });
                return Err(e.into());
            }
        };

        let events = {
            let mut state = self.inner.state.lock();
            if self.inner.open_generation.load(Ordering::SeqCst) != generation
                || state.open.as_ref() != Some(&key)
            {
                tracing::debug!(conversation_id = %conversation_id, "dropping stale history");
                return Ok(());
            }
            let confirmed = state
                .threads
                .apply_snapshot(&key, &snapshot, &self.inner.me);
            confirm_delivered(&mut state.delivery, &key, confirmed)
        };
        for event in events {
            self.emit(event);
        }
        self.emit(ChatEvent::ThreadUpdated { key });
        Ok(())
    }

    // --- sending ---

    /// Send `draft` in the open conversation.
    ///
    /// Validation happens before anything else; a rejected draft leaves no
    /// trace and makes no call. Otherwise the message is shown at once as
    /// `Sent` and the REST call runs in the background.
    ///
    /// # Errors
    ///
    /// [`ChatError::NoOpenConversation`],
    /// [`ChatError::UnknownCounterparty`], or [`ChatError::Validation`].
    pub async fn send(&self, draft: Draft) -> Result<SendTicket, ChatError> {
        let key = self.open_key().ok_or(ChatError::NoOpenConversation)?;
        let receiver = self
            .counterparty_of(&key)
            .ok_or_else(|| ChatError::UnknownCounterparty(key.clone()))?;
        let draft = draft.normalized();
        draft.validate(&self.inner.me, &receiver)?;

        let client_id = ClientMessageId::new();
        let send = {
            let mut state = self.inner.state.lock();
            let send =
                state
                    .delivery
                    .track(client_id.clone(), key.clone(), receiver, draft.clone());
            let mut message = Message::optimistic(
                client_id.clone(),
                self.inner.me.clone(),
                draft.content,
                draft.attachment_url,
                Timestamp::now(),
            );
            state.delivery.mark_sent(&client_id)?;
            message.status = DeliveryStatus::Sent;
            state.threads.insert_optimistic(&key, message);
            send
        };
        tracing::debug!(client_id = %client_id, key = %key, "message queued");

        self.emit(ChatEvent::ThreadUpdated { key: key.clone() });
        self.inner.typing.blur().await;
        tokio::spawn(self.clone().deliver(send));

        Ok(SendTicket {
            client_id,
            conversation: key,
        })
    }

    /// Retry a failed send under the same client id.
    ///
    /// # Errors
    ///
    /// [`ChatError::Delivery`] if the message is unknown or not failed.
    pub async fn retry(&self, client_id: &ClientMessageId) -> Result<(), ChatError> {
        let (send, events) = {
            let mut state = self.inner.state.lock();
            let send = state.delivery.retry(client_id)?;
            let key = send.conversation.clone();
            state
                .threads
                .set_status(&key, client_id, DeliveryStatus::Pending);
            state.delivery.mark_sent(client_id)?;
            state.threads.set_status(&key, client_id, DeliveryStatus::Sent);
            let events = [DeliveryStatus::Pending, DeliveryStatus::Sent].map(|status| {
                ChatEvent::StatusChanged {
                    key: key.clone(),
                    client_id: client_id.clone(),
                    status,
                }
            });
            (send, events)
        };
        tracing::info!(client_id = %client_id, attempt = send.attempt, "retrying send");
        for event in events {
            self.emit(event);
        }
        tokio::spawn(self.clone().deliver(send));
        Ok(())
    }

    /// Remove a failed message locally. Never contacts the server.
    ///
    /// # Errors
    ///
    /// [`ChatError::Delivery`] if the message is unknown or not failed.
    pub fn discard(&self, client_id: &ClientMessageId) -> Result<(), ChatError> {
        let key = {
            let mut state = self.inner.state.lock();
            let send = state.delivery.discard(client_id)?;
            state.threads.discard(&send.conversation, client_id);
            send.conversation
        };
        tracing::debug!(client_id = %client_id, "failed message discarded");
        self.emit(ChatEvent::ThreadUpdated { key });
        Ok(())
    }

    /// Delivery status of a local message.
    #[must_use]
    pub fn status(&self, client_id: &ClientMessageId) -> Option<DeliveryStatus> {
        self.inner.state.lock().delivery.status(client_id)
    }

    // --- presence and typing ---

    /// The local input toward the open conversation changed.
    pub async fn input_changed(&self, text: &str) {
        let Some(receiver) = self.open_key().and_then(|key| self.counterparty_of(&key)) else {
            return;
        };
        self.inner.typing.input_changed(&receiver, text).await;
    }

    /// The local input lost focus.
    pub async fn blur(&self) {
        self.inner.typing.blur().await;
    }

    /// Whether `user` is online.
    #[must_use]
    pub fn is_online(&self, user: &UserId) -> bool {
        self.inner.presence.is_online(user)
    }

    /// Whether `user` is typing toward the current user.
    #[must_use]
    pub fn is_typing(&self, user: &UserId) -> bool {
        self.inner.presence.is_typing(user)
    }

    /// Users currently typing toward the current user.
    #[must_use]
    pub fn typing_users(&self) -> Vec<UserId> {
        self.inner.presence.typing_users()
    }

    // --- internals ---

    /// Subscribe to inbound events for the live connection epoch, once.
    fn bind(&self) {
        if !self.inner.connection.is_connected() {
            return;
        }
        let epoch = self.inner.connection.epoch();
        let mut state = self.inner.state.lock();
        if state.bound_epoch == epoch {
            return;
        }
        for id in state.subscriptions.drain(..) {
            self.inner.connection.unsubscribe(id);
        }
        for name in SUBSCRIBED_EVENTS {
            let inbound = self.inner.inbound.clone();
            let id = self.inner.connection.subscribe(name, move |event| {
                let _ = inbound.send(event.clone());
            });
            state.subscriptions.push(id);
        }
        state.bound_epoch = epoch;
        tracing::debug!(epoch, "session subscriptions bound");
    }

    async fn deliver(self, send: OutgoingSend) {
        let request = SendMessageRequest {
            receiver_id: send.receiver.clone(),
            content: send.draft.content.clone(),
            attachment_url: send.draft.attachment_url.clone(),
            client_id: Some(send.client_id.clone()),
        };
        match self.inner.api.send_message(&request).await {
            Ok(response) => self.on_send_confirmed(&send.client_id, response).await,
            Err(e) => {
                tracing::warn!(
                    client_id = %send.client_id,
                    attempt = send.attempt,
                    error = %e,
                    "send rejected"
                );
                tokio::time::sleep(self.inner.config.failure_grace).await;
                self.on_send_failed(&send, &e);
            }
        }
    }

    async fn on_send_confirmed(&self, client_id: &ClientMessageId, response: ConversationMessageDto) {
        let durable = ConversationKey::Durable(response.conversation_id.clone());
        let (upgraded, events) = {
            let mut state = self.inner.state.lock();
            let Some(current) = state.delivery.get(client_id).map(|s| s.conversation.clone())
            else {
                tracing::debug!(client_id = %client_id, "response for discarded message");
                return;
            };

            let upgraded = if current == durable {
                None
            } else {
                state.threads.rekey(&current, &durable);
                state.delivery.rekey(&current, &durable);
                if state.open.as_ref() == Some(&current) {
                    state.open = Some(durable.clone());
                }
                Some(current)
            };

            state
                .threads
                .confirm_send(&durable, client_id, &response.message, &self.inner.me);
            let mut events = Vec::new();
            match state.delivery.confirm(client_id) {
                Ok(true) => events.push(ChatEvent::StatusChanged {
                    key: durable.clone(),
                    client_id: client_id.clone(),
                    status: DeliveryStatus::Confirmed,
                }),
                Ok(false) => {}
                Err(e) => tracing::debug!(client_id = %client_id, error = %e, "confirm skipped"),
            }
            (upgraded, events)
        };
        tracing::debug!(client_id = %client_id, message_id = %response.message.id, "send confirmed");

        if let Some(from) = upgraded {
            if let ConversationKey::Provisional { counterparty } = &from {
                self.inner
                    .store
                    .upgrade(counterparty, &response.conversation_id);
            }
            self.emit(ChatEvent::ConversationUpgraded {
                from,
                to: durable.clone(),
            });
            if self.open_key().as_ref() == Some(&durable) {
                self.publish_quietly(ClientEvent::JoinChat {
                    conversation_id: response.conversation_id.clone(),
                })
                .await;
            }
        }

        for event in events {
            self.emit(event);
        }
        self.emit(ChatEvent::ThreadUpdated { key: durable });

        let patch = ConversationPatch::MessageArrived {
            conversation_id: response.conversation_id,
            message: LastMessage {
                id: Some(response.message.id.clone()),
                content: response.message.content.clone(),
                timestamp: response.message.sent_at,
                sender_id: response.message.sender_id.clone(),
            },
            count_unread: false,
        };
        self.apply_patch(patch);
    }

    fn on_send_failed(&self, send: &OutgoingSend, error: &ApiError) {
        let key = {
            let mut state = self.inner.state.lock();
            let Some(current) = state.delivery.get(&send.client_id).map(|s| s.conversation.clone())
            else {
                return;
            };
            match state.delivery.fail_if_current(&send.client_id, send.attempt) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    tracing::debug!(client_id = %send.client_id, error = %e, "failure skipped");
                    return;
                }
            }
            state
                .threads
                .set_status(&current, &send.client_id, DeliveryStatus::Failed);
            current
        };
        tracing::info!(client_id = %send.client_id, attempt = send.attempt, "send failed");
        self.emit(ChatEvent::StatusChanged {
            key: key.clone(),
            client_id: send.client_id.clone(),
            status: DeliveryStatus::Failed,
        });
        self.emit(ChatEvent::SendFailed {
            client_id: send.client_id.clone(),
            reason: reasons::describe(error),
        });
        self.emit(ChatEvent::ThreadUpdated { key });
    }

    async fn handle_inbound(&self, event: ServerEvent) {
        if let Some((notice, phase)) = event.as_typing() {
            self.on_typing(&notice.user_id, phase);
            return;
        }
        match event {
            ServerEvent::NewMessage(dto) => self.on_new_message(dto),
            ServerEvent::MessageNotification {
                conversation_id,
                sender_id,
            } => self.on_notification(&conversation_id, &sender_id),
            ServerEvent::PresenceUpdate(update) => {
                if self.inner.presence.apply(&update) {
                    self.inner.store.set_online(&update.user_id, update.online);
                    self.emit(ChatEvent::PresenceChanged {
                        user_id: update.user_id,
                        online: update.online,
                    });
                }
            }
            other => {
                tracing::debug!(event = %other.name(), "ignoring inbound event");
            }
        }
        tokio::task::yield_now().await;
    }

    fn on_new_message(&self, dto: ConversationMessageDto) {
        let key = ConversationKey::Durable(dto.conversation_id.clone());
        let is_own = dto.message.sender_id == self.inner.me;
        let (tracked, is_open, events) = {
            let mut state = self.inner.state.lock();
            let is_open = state.open.as_ref() == Some(&key);
            let tracked = is_open || state.threads.contains(&key);
            let events = if tracked {
                let confirmed = state
                    .threads
                    .apply_push(&key, &dto.message, &self.inner.me);
                confirm_delivered(&mut state.delivery, &key, confirmed)
            } else {
                Vec::new()
            };
            (tracked, is_open, events)
        };
        tracing::debug!(
            conversation_id = %dto.conversation_id,
            message_id = %dto.message.id,
            tracked,
            "message pushed"
        );
        for event in events {
            self.emit(event);
        }
        if tracked {
            self.emit(ChatEvent::ThreadUpdated { key });
        }

        self.apply_patch(ConversationPatch::MessageArrived {
            conversation_id: dto.conversation_id.clone(),
            message: LastMessage {
                id: Some(dto.message.id.clone()),
                content: dto.message.content.clone(),
                timestamp: dto.message.sent_at,
                sender_id: dto.message.sender_id.clone(),
            },
            count_unread: !is_own && !is_open,
        });
        if is_open && !is_own {
            self.mark_read_in_background(dto.conversation_id);
        }
    }

    fn on_notification(&self, conversation_id: &ConversationId, sender_id: &UserId) {
        let key = ConversationKey::Durable(conversation_id.clone());
        tracing::debug!(conversation_id = %conversation_id, sender_id = %sender_id, "message notification");
        if self.open_key().as_ref() == Some(&key) {
            self.request_refresh(Refresh::OpenThread);
        }
        if self.inner.store.role().is_some() {
            self.request_refresh(Refresh::ConversationList);
        }
    }

    fn on_typing(&self, user: &UserId, phase: TypingPhase) {
        if !self.inner.presence.apply_typing(user, phase) {
            return;
        }
        let typing = phase == TypingPhase::Started;
        self.emit(ChatEvent::TypingChanged {
            user_id: user.clone(),
            typing,
        });
        if typing {
            let weak = Arc::downgrade(&self.inner);
            let expiry = self.inner.presence.typing_expiry();
            tokio::spawn(async move {
                tokio::time::sleep(expiry).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let session = Self { inner };
                for user_id in session.inner.presence.prune_expired() {
                    session.emit(ChatEvent::TypingChanged {
                        user_id,
                        typing: false,
                    });
                }
            });
        }
    }

    async fn on_connection_event(&self, event: ConnectionEvent) {
        match &event {
            ConnectionEvent::Connected { epoch } => {
                tracing::info!(epoch, "connection up, rebinding");
                self.bind();
                if let Some(ConversationKey::Durable(id)) = self.open_key() {
                    self.publish_quietly(ClientEvent::JoinChat {
                        conversation_id: id,
                    })
                    .await;
                    self.request_refresh(Refresh::OpenThread);
                }
                if self.inner.store.role().is_some() {
                    self.request_refresh(Refresh::ConversationList);
                }
            }
            ConnectionEvent::Disconnected { epoch } => {
                tracing::info!(epoch, "connection lost, clearing presence");
                self.inner.presence.clear();
                self.inner.store.clear_online();
                self.emit(ChatEvent::PresenceCleared);
            }
            ConnectionEvent::Reconnecting { .. }
            | ConnectionEvent::ReconnectFailed { .. }
            | ConnectionEvent::AuthRejected { .. } => {}
        }
        self.emit(ChatEvent::Connection(event));
    }

    /// Catch up with connection events that were skipped: bind to the live
    /// epoch, or drop presence if the connection is gone.
    fn resync_after_lag(&self) {
        if self.inner.connection.is_connected() {
            self.bind();
            if self.inner.store.role().is_some() {
                self.request_refresh(Refresh::ConversationList);
            }
            if self.open_key().is_some() {
                self.request_refresh(Refresh::OpenThread);
            }
        } else {
            self.inner.presence.clear();
            self.inner.store.clear_online();
            self.emit(ChatEvent::PresenceCleared);
        }
    }

    /// Run `kind` in the background; while one is running, further requests
    /// collapse into a single rerun.
    fn request_refresh(&self, kind: Refresh) {
        {
            let mut gates = self.inner.refresh.lock();
            let gate = gates.entry(kind).or_default();
            if gate.running {
                gate.dirty = true;
                return;
            }
            gate.running = true;
        }
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                session.run_refresh(kind).await;
                let mut gates = session.inner.refresh.lock();
                let gate = gates.entry(kind).or_default();
                if gate.dirty {
                    gate.dirty = false;
                } else {
                    gate.running = false;
                    break;
                }
            }
        });
    }

    async fn run_refresh(&self, kind: Refresh) {
        let result = match kind {
            Refresh::OpenThread => self.refresh_open().await,
            Refresh::ConversationList => match self.inner.store.role() {
                Some(role) => self.load_conversations(role).await.map(|_| ()),
                None => Ok(()),
            },
        };
        if let Err(e) = result {
            tracing::debug!(?kind, error = %e, "background refresh failed");
        }
    }

    fn apply_patch(&self, patch: ConversationPatch) {
        match self.inner.store.patch(patch) {
            PatchOutcome::Applied => self.emit_conversations_changed(),
            PatchOutcome::Unknown => {
                if self.inner.store.role().is_some() {
                    self.request_refresh(Refresh::ConversationList);
                }
            }
        }
    }

    fn mark_read_in_background(&self, conversation_id: ConversationId) {
        let session = self.clone();
        tokio::spawn(async move {
            match session.inner.api.mark_read(&conversation_id).await {
                Ok(()) => {
                    if session
                        .inner
                        .store
                        .patch(ConversationPatch::MarkedRead(conversation_id))
                        == PatchOutcome::Applied
                    {
                        session.emit_conversations_changed();
                    }
                }
                Err(e) => {
                    tracing::debug!(conversation_id = %conversation_id, error = %e, "mark read failed");
                }
            }
        });
    }

    fn counterparty_of(&self, key: &ConversationKey) -> Option<UserId> {
        self.inner.store.counterparty_of(key).or_else(|| {
            self.inner
                .state
                .lock()
                .threads
                .thread(key)
                .iter()
                .find(|m| !m.is_own)
                .map(|m| m.sender_id.clone())
        })
    }

    fn sync_online_flags(&self) {
        for user in self.inner.presence.online_users() {
            self.inner.store.set_online(&user, true);
        }
    }

    async fn publish_quietly(&self, event: ClientEvent) {
        if let Err(e) = self.inner.connection.publish(&event).await {
            tracing::debug!(event = event.name(), error = %e, "room event not delivered");
        }
    }

    fn emit_conversations_changed(&self) {
        self.emit(ChatEvent::ConversationsChanged {
            total_unread: self.inner.store.total_unread(),
        });
    }

    fn emit(&self, event: ChatEvent) {
        match self.inner.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(?event, "chat event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Sync the delivery tracker with entries a merge just confirmed.
fn confirm_delivered(
    delivery: &mut DeliveryTracker,
    key: &ConversationKey,
    confirmed: Vec<ClientMessageId>,
) -> Vec<ChatEvent> {
    confirmed
        .into_iter()
        .filter(|id| match delivery.confirm(id) {
            Ok(changed) => changed,
            Err(e) => {
                tracing::debug!(client_id = %id, error = %e, "untracked confirmation");
                false
            }
        })
        .map(|client_id| ChatEvent::StatusChanged {
            key: key.clone(),
            client_id,
            status: DeliveryStatus::Confirmed,
        })
        .collect()
}

/// Applies inbound events one at a time, in arrival order.
async fn dispatch_loop<A: ChatApi, C: Connector>(
    inner: Weak<SessionInner<A, C>>,
    mut inbound: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        ChatSession { inner }.handle_inbound(event).await;
    }
    tracing::debug!("chat dispatch task exiting");
}

/// Reacts to connection lifecycle changes and forwards connectivity.
async fn connection_loop<A: ChatApi, C: Connector>(
    inner: Weak<SessionInner<A, C>>,
    mut events: broadcast::Receiver<ConnectionEvent>,
    mut connectivity: watch::Receiver<Connectivity>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "connection events lagged, resyncing");
                        let Some(inner) = inner.upgrade() else {
                            break;
                        };
                        ChatSession { inner }.resync_after_lag();
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                ChatSession { inner }.on_connection_event(event).await;
            }
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connectivity.borrow_and_update();
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                ChatSession { inner }.emit(ChatEvent::Connectivity(state));
            }
        }
    }
    tracing::debug!("chat connection task exiting");
}
