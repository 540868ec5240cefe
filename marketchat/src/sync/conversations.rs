//! Conversation list for the signed-in user.
//!
//! Holds the buyer-side or seller-side projection of the user's threads,
//! loaded from REST and kept current by incremental patches. Provisional
//! conversations (no server id yet) live here too until their first send is
//! confirmed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use marketchat_proto::ids::{ConversationId, ConversationKey, MessageId, Timestamp, UserId};
use marketchat_proto::rest::{ConversationSummaryDto, LastMessageDto, Role};

use crate::api::{ApiError, ChatApi};

/// The other participant of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counterparty {
    /// User id.
    pub id: UserId,
    /// Display name.
    pub name: String,
    /// Whether the user is currently connected.
    pub online: bool,
}

/// Preview of the newest message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessage {
    /// Server id, if the message has one yet.
    pub id: Option<MessageId>,
    /// Text, if any.
    pub content: Option<String>,
    /// When the message was sent.
    pub timestamp: Timestamp,
    /// Author.
    pub sender_id: UserId,
}

impl From<LastMessageDto> for LastMessage {
    fn from(dto: LastMessageDto) -> Self {
        Self {
            id: Some(dto.id),
            content: dto.content,
            timestamp: dto.timestamp,
            sender_id: dto.sender_id,
        }
    }
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Durable or provisional identity.
    pub key: ConversationKey,
    /// The other participant.
    pub counterparty: Counterparty,
    /// Messages not yet read by the current user.
    pub unread: u32,
    /// Newest message, if any.
    pub last_message: Option<LastMessage>,
}

impl Conversation {
    fn from_summary(dto: ConversationSummaryDto) -> Self {
        Self {
            key: ConversationKey::Durable(dto.id),
            counterparty: Counterparty {
                id: dto.counterparty_id,
                name: dto.counterparty_name,
                online: false,
            },
            unread: dto.unread_count,
            last_message: dto.last_message.map(LastMessage::from),
        }
    }

    /// Timestamp the list is ordered by.
    #[must_use]
    pub fn ordering_timestamp(&self) -> Option<Timestamp> {
        self.last_message.as_ref().map(|m| m.timestamp)
    }
}

/// Outcome of the most recent list fetch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadState {
    /// Nothing fetched yet.
    #[default]
    Idle,
    /// A fetch is in flight.
    Loading,
    /// The list reflects the server.
    Loaded,
    /// The last fetch failed; the previous list is still shown.
    Failed(String),
}

/// Result of a debounced search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Results were applied; holds the number of conversations shown.
    Applied(usize),
    /// A newer search replaced this one before it completed.
    Superseded,
}

/// Incremental change to one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationPatch {
    /// A message arrived or was sent.
    MessageArrived {
        /// Conversation the message belongs to.
        conversation_id: ConversationId,
        /// Preview of the message.
        message: LastMessage,
        /// Whether the unread counter should go up.
        count_unread: bool,
    },
    /// The server reported a new unread count.
    UnreadChanged {
        /// Affected conversation.
        conversation_id: ConversationId,
        /// New counter value.
        unread: u32,
    },
    /// The user read the conversation.
    MarkedRead(ConversationId),
}

impl ConversationPatch {
    /// Conversation the patch applies to.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::MessageArrived {
                conversation_id, ..
            }
            | Self::UnreadChanged {
                conversation_id, ..
            }
            | Self::MarkedRead(conversation_id) => conversation_id,
        }
    }
}

/// Result of [`ConversationStore::patch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The conversation was updated.
    Applied,
    /// The conversation is not listed; reload the list.
    Unknown,
}

#[derive(Debug, Default)]
struct StoreState {
    role: Option<Role>,
    conversations: Vec<Conversation>,
    load_state: LoadState,
    query: Option<String>,
}

/// Conversation list backed by a [`ChatApi`].
pub struct ConversationStore<A: ChatApi> {
    api: Arc<A>,
    debounce: Duration,
    state: Mutex<StoreState>,
    /// Bumped by every list replacement; older results are dropped.
    list_generation: AtomicU64,
    /// Bumped by every search call; older pending searches give up.
    search_ticket: AtomicU64,
}

impl<A: ChatApi> ConversationStore<A> {
    /// Creates an empty store with the given search debounce.
    pub fn new(api: Arc<A>, debounce: Duration) -> Self {
        Self {
            api,
            debounce,
            state: Mutex::new(StoreState::default()),
            list_generation: AtomicU64::new(0),
            search_ticket: AtomicU64::new(0),
        }
    }

    /// Fetches the full list for `role` and replaces the contents.
    ///
    /// Provisional conversations without a listed counterpart survive the
    /// reload, as do known online flags. On failure the previous list is
    /// kept and [`LoadState::Failed`] is recorded.
    ///
    /// Returns the number of conversations listed.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the failed fetch.
    pub async fn load(&self, role: Role) -> Result<usize, ApiError> {
        let generation = self.begin_fetch(role, None);
        match self.api.list_conversations(role).await {
            Ok(list) => Ok(self.apply_list(generation, list)),
            Err(e) => {
                self.fail_fetch(generation, &e);
                Err(e)
            }
        }
    }

    /// Debounced search within the current role.
    ///
    /// Waits for the debounce interval; if another search starts meanwhile,
    /// this one returns [`SearchOutcome::Superseded`] without a request. An
    /// empty query reloads the full list.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of the failed fetch.
    pub async fn search(&self, query: &str) -> Result<SearchOutcome, ApiError> {
        let ticket = self.search_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.debounce).await;
        if self.search_ticket.load(Ordering::SeqCst) != ticket {
            return Ok(SearchOutcome::Superseded);
        }

        let role = self.role().unwrap_or(Role::Buyer);
        let query = query.trim();
        if query.is_empty() {
            return self.load(role).await.map(SearchOutcome::Applied);
        }

        let generation = self.begin_fetch(role, Some(query.to_string()));
        match self.api.search_conversations(role, query).await {
            Ok(list) => {
                if self.search_ticket.load(Ordering::SeqCst) != ticket {
                    return Ok(SearchOutcome::Superseded);
                }
                Ok(SearchOutcome::Applied(self.apply_list(generation, list)))
            }
            Err(e) => {
                self.fail_fetch(generation, &e);
                Err(e)
            }
        }
    }

    /// Applies an incremental change to one conversation.
    pub fn patch(&self, patch: ConversationPatch) -> PatchOutcome {
        let mut state = self.state.lock();
        let key = ConversationKey::Durable(patch.conversation_id().clone());
        let Some(conversation) = state.conversations.iter_mut().find(|c| c.key == key) else {
            tracing::debug!(conversation_id = %patch.conversation_id(), "patch for unlisted conversation");
            return PatchOutcome::Unknown;
        };
        match patch {
            ConversationPatch::MessageArrived {
                message,
                count_unread,
                ..
            } => {
                let newer = conversation
                    .ordering_timestamp()
                    .is_none_or(|current| message.timestamp >= current);
                if newer {
                    conversation.last_message = Some(message);
                }
                if count_unread {
                    conversation.unread = conversation.unread.saturating_add(1);
                }
            }
            ConversationPatch::UnreadChanged { unread, .. } => conversation.unread = unread,
            ConversationPatch::MarkedRead(_) => conversation.unread = 0,
        }
        sort_conversations(&mut state.conversations);
        PatchOutcome::Applied
    }

    /// Returns the key to open a chat with `counterparty`, adding a
    /// provisional conversation if none is listed.
    pub fn ensure_provisional(&self, counterparty: &UserId, name: &str) -> ConversationKey {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .conversations
            .iter()
            .find(|c| c.counterparty.id == *counterparty)
        {
            return existing.key.clone();
        }
        let key = ConversationKey::provisional(counterparty.clone());
        tracing::debug!(key = %key, "adding provisional conversation");
        state.conversations.push(Conversation {
            key: key.clone(),
            counterparty: Counterparty {
                id: counterparty.clone(),
                name: name.to_string(),
                online: false,
            },
            unread: 0,
            last_message: None,
        });
        sort_conversations(&mut state.conversations);
        key
    }

    /// Upgrades the provisional conversation with `counterparty` to
    /// `conversation_id`.
    ///
    /// If the durable conversation is already listed, the provisional entry
    /// is dropped instead. Returns `false` if there was nothing to upgrade.
    pub fn upgrade(&self, counterparty: &UserId, conversation_id: &ConversationId) -> bool {
        let provisional = ConversationKey::provisional(counterparty.clone());
        let durable = ConversationKey::Durable(conversation_id.clone());
        let mut state = self.state.lock();
        let Some(index) = state.conversations.iter().position(|c| c.key == provisional) else {
            return false;
        };
        if state.conversations.iter().any(|c| c.key == durable) {
            state.conversations.remove(index);
        } else {
            state.conversations[index].key = durable;
        }
        tracing::info!(counterparty = %counterparty, conversation_id = %conversation_id, "conversation upgraded");
        sort_conversations(&mut state.conversations);
        true
    }

    /// Updates the online flag of every conversation with `user`.
    pub fn set_online(&self, user: &UserId, online: bool) {
        let mut state = self.state.lock();
        for conversation in state
            .conversations
            .iter_mut()
            .filter(|c| c.counterparty.id == *user)
        {
            conversation.counterparty.online = online;
        }
    }

    /// Clears every online flag.
    pub fn clear_online(&self) {
        let mut state = self.state.lock();
        for conversation in &mut state.conversations {
            conversation.counterparty.online = false;
        }
    }

    /// Sum of all unread counters.
    #[must_use]
    pub fn total_unread(&self) -> u32 {
        self.state
            .lock()
            .conversations
            .iter()
            .fold(0u32, |sum, c| sum.saturating_add(c.unread))
    }

    /// Snapshot of the list in display order.
    #[must_use]
    pub fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().conversations.clone()
    }

    /// The conversation with `key`.
    #[must_use]
    pub fn get(&self, key: &ConversationKey) -> Option<Conversation> {
        self.state
            .lock()
            .conversations
            .iter()
            .find(|c| c.key == *key)
            .cloned()
    }

    /// Counterparty of the conversation with `key`.
    ///
    /// For a provisional key this is known without a lookup.
    #[must_use]
    pub fn counterparty_of(&self, key: &ConversationKey) -> Option<UserId> {
        match key {
            ConversationKey::Provisional { counterparty } => Some(counterparty.clone()),
            ConversationKey::Durable(_) => self.get(key).map(|c| c.counterparty.id),
        }
    }

    /// Role of the last list fetch.
    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.state.lock().role
    }

    /// Active search query, if the list shows search results.
    #[must_use]
    pub fn query(&self) -> Option<String> {
        self.state.lock().query.clone()
    }

    /// Outcome of the last list fetch.
    #[must_use]
    pub fn load_state(&self) -> LoadState {
        self.state.lock().load_state.clone()
    }

    /// Forgets everything (logout).
    pub fn clear(&self) {
        self.list_generation.fetch_add(1, Ordering::SeqCst);
        *self.state.lock() = StoreState::default();
    }

    fn begin_fetch(&self, role: Role, query: Option<String>) -> u64 {
        let generation = self.list_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock();
        state.role = Some(role);
        state.query = query;
        state.load_state = LoadState::Loading;
        generation
    }

    fn apply_list(&self, generation: u64, list: Vec<ConversationSummaryDto>) -> usize {
        let mut state = self.state.lock();
        if self.list_generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(generation, "dropping stale conversation list");
            return state.conversations.len();
        }

        let previous = std::mem::take(&mut state.conversations);
        let mut conversations: Vec<Conversation> =
            list.into_iter().map(Conversation::from_summary).collect();
        for conversation in &mut conversations {
            conversation.counterparty.online = previous
                .iter()
                .any(|p| p.counterparty.id == conversation.counterparty.id && p.counterparty.online);
        }
        if state.query.is_none() {
            let provisional = previous.into_iter().filter(|p| {
                p.key.is_provisional()
                    && !conversations
                        .iter()
                        .any(|c| c.counterparty.id == p.counterparty.id)
            });
            let provisional: Vec<Conversation> = provisional.collect();
            conversations.extend(provisional);
        }
        sort_conversations(&mut conversations);

        state.conversations = conversations;
        state.load_state = LoadState::Loaded;
        tracing::debug!(count = state.conversations.len(), "conversation list replaced");
        state.conversations.len()
    }

    fn fail_fetch(&self, generation: u64, error: &ApiError) {
        tracing::warn!(error = %error, "conversation list fetch failed");
        if self.list_generation.load(Ordering::SeqCst) == generation {
            self.state.lock().load_state = LoadState::Failed(error.to_string());
        }
    }
}

/// Newest last message first; conversations without one keep their relative
/// order after all others.
fn sort_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| match (a.ordering_timestamp(), b.ordering_timestamp()) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}
