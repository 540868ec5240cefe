//! Server-like in-memory [`ChatApi`].
//!
//! Behaves like the real backend for one signed-in user: sending to a
//! counterparty without a conversation creates one, messages get server ids
//! and timestamps, unread counters move. Every call is counted, and sends,
//! lists and fetches can be made to fail. Used by tests and by the console
//! binary's `--demo` mode.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use marketchat_proto::ids::{ConversationId, MessageId, Timestamp, UserId};
use marketchat_proto::rest::{
    ConversationMessageDto, ConversationSummaryDto, LastMessageDto, MessageDto, Role,
    SendMessageRequest,
};

use super::{ApiError, ChatApi};

/// Number of calls made to each endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApiCalls {
    /// `list_conversations` calls.
    pub list: usize,
    /// `search_conversations` calls.
    pub search: usize,
    /// `fetch_messages` calls.
    pub fetch: usize,
    /// `send_message` calls.
    pub send: usize,
    /// `mark_read` calls.
    pub mark_read: usize,
}

impl ApiCalls {
    /// Total calls across all endpoints.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.list + self.search + self.fetch + self.send + self.mark_read
    }
}

/// Callback invoked after the fake persists a sent message, before the
/// send call returns. Tests use it to push `new_message` ahead of the
/// REST response, the way a real server often does.
pub type PersistHook = Arc<dyn Fn(&ConversationMessageDto) + Send + Sync>;

struct StoredConversation {
    id: ConversationId,
    role: Role,
    counterparty_id: UserId,
    counterparty_name: String,
    messages: Vec<MessageDto>,
    unread: u32,
}

impl StoredConversation {
    fn summary(&self) -> ConversationSummaryDto {
        ConversationSummaryDto {
            id: self.id.clone(),
            counterparty_id: self.counterparty_id.clone(),
            counterparty_name: self.counterparty_name.clone(),
            last_message: self.messages.last().map(|m| LastMessageDto {
                id: m.id.clone(),
                content: m.content.clone(),
                timestamp: m.sent_at,
                sender_id: m.sender_id.clone(),
            }),
            unread_count: self.unread,
        }
    }
}

struct MemoryState {
    me: UserId,
    conversations: Vec<StoredConversation>,
    next_id: u64,
    calls: ApiCalls,
    failing_sends: usize,
    send_failure: ApiError,
    fail_lists: bool,
    fail_fetches: bool,
    send_delay: Option<Duration>,
    fetch_delay: Option<Duration>,
    echo_client_ids: bool,
    on_persist: Option<PersistHook>,
}

/// In-memory fake of the chat REST backend.
#[derive(Clone)]
pub struct InMemoryApi {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryApi {
    /// Create an empty backend for the signed-in user `me`.
    #[must_use]
    pub fn new(me: UserId) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                me,
                conversations: Vec::new(),
                next_id: 0,
                calls: ApiCalls::default(),
                failing_sends: 0,
                send_failure: ApiError::Timeout,
                fail_lists: false,
                fail_fetches: false,
                send_delay: None,
                fetch_delay: None,
                echo_client_ids: false,
                on_persist: None,
            })),
        }
    }

    /// Add an existing conversation with `counterparty`.
    pub fn add_conversation(
        &self,
        role: Role,
        counterparty: UserId,
        counterparty_name: impl Into<String>,
    ) -> ConversationId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = ConversationId::new(format!("conv-{}", state.next_id));
        state.conversations.push(StoredConversation {
            id: id.clone(),
            role,
            counterparty_id: counterparty,
            counterparty_name: counterparty_name.into(),
            messages: Vec::new(),
            unread: 0,
        });
        id
    }

    /// Persist a message from `sender` as if another client had sent it.
    ///
    /// Messages from anyone but the signed-in user bump the unread counter.
    /// Returns `None` if the conversation does not exist.
    pub fn seed_message(
        &self,
        conversation_id: &ConversationId,
        sender: UserId,
        content: impl Into<String>,
    ) -> Option<ConversationMessageDto> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let message = MessageDto {
            id: MessageId::new(format!("m-{}", state.next_id)),
            sender_id: sender,
            content: Some(content.into()),
            attachment_url: None,
            sent_at: Timestamp::now(),
            client_id: None,
        };
        let me = state.me.clone();
        let conversation = state
            .conversations
            .iter_mut()
            .find(|c| &c.id == conversation_id)?;
        if message.sender_id != me {
            conversation.unread += 1;
        }
        conversation.messages.push(message.clone());
        Some(ConversationMessageDto {
            conversation_id: conversation_id.clone(),
            message,
        })
    }

    /// Messages stored for a conversation.
    #[must_use]
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<MessageDto> {
        self.state
            .lock()
            .conversations
            .iter()
            .find(|c| &c.id == conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// Conversation the signed-in user has with `counterparty`, if any.
    #[must_use]
    pub fn conversation_with(&self, counterparty: &UserId) -> Option<ConversationId> {
        self.state
            .lock()
            .conversations
            .iter()
            .find(|c| &c.counterparty_id == counterparty)
            .map(|c| c.id.clone())
    }

    /// Call counters so far.
    #[must_use]
    pub fn calls(&self) -> ApiCalls {
        self.state.lock().calls
    }

    /// Fail the next `n` sends with `error`.
    pub fn fail_next_sends(&self, n: usize, error: ApiError) {
        let mut state = self.state.lock();
        state.failing_sends = n;
        state.send_failure = error;
    }

    /// Make list and search calls fail with a 503.
    pub fn fail_lists(&self, fail: bool) {
        self.state.lock().fail_lists = fail;
    }

    /// Make history fetches fail with a 503.
    pub fn fail_fetches(&self, fail: bool) {
        self.state.lock().fail_fetches = fail;
    }

    /// Delay every send by `delay` before it is persisted.
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        self.state.lock().send_delay = delay;
    }

    /// Delay every history fetch by `delay`.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.state.lock().fetch_delay = delay;
    }

    /// Echo the request's `clientId` in responses.
    pub fn echo_client_ids(&self, echo: bool) {
        self.state.lock().echo_client_ids = echo;
    }

    /// Install a hook run after each successful persist.
    pub fn on_persist<F>(&self, hook: F)
    where
        F: Fn(&ConversationMessageDto) + Send + Sync + 'static,
    {
        self.state.lock().on_persist = Some(Arc::new(hook));
    }

    fn unavailable() -> ApiError {
        ApiError::Status {
            status: 503,
            message: Some("service unavailable".into()),
        }
    }

    fn summaries(&self, role: Role, query: Option<&str>) -> Vec<ConversationSummaryDto> {
        let needle = query.map(str::to_lowercase);
        self.state
            .lock()
            .conversations
            .iter()
            .filter(|c| c.role == role)
            .filter(|c| {
                needle.as_deref().is_none_or(|q| {
                    c.counterparty_name.to_lowercase().contains(q)
                        || c.messages.iter().any(|m| {
                            m.content
                                .as_deref()
                                .is_some_and(|text| text.to_lowercase().contains(q))
                        })
                })
            })
            .map(StoredConversation::summary)
            .collect()
    }
}

impl ChatApi for InMemoryApi {
    async fn list_conversations(&self, role: Role) -> Result<Vec<ConversationSummaryDto>, ApiError> {
        let fail = {
            let mut state = self.state.lock();
            state.calls.list += 1;
            state.fail_lists
        };
        if fail {
            return Err(Self::unavailable());
        }
        Ok(self.summaries(role, None))
    }

    async fn search_conversations(
        &self,
        role: Role,
        query: &str,
    ) -> Result<Vec<ConversationSummaryDto>, ApiError> {
        let fail = {
            let mut state = self.state.lock();
            state.calls.search += 1;
            state.fail_lists
        };
        if fail {
            return Err(Self::unavailable());
        }
        Ok(self.summaries(role, Some(query)))
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageDto>, ApiError> {
        let (fail, delay) = {
            let mut state = self.state.lock();
            state.calls.fetch += 1;
            (state.fail_fetches, state.fetch_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(Self::unavailable());
        }
        let state = self.state.lock();
        state
            .conversations
            .iter()
            .find(|c| &c.id == conversation_id)
            .map(|c| c.messages.clone())
            .ok_or_else(|| ApiError::Status {
                status: 404,
                message: Some("Conversation not found".into()),
            })
    }

    async fn send_message(
        &self,
        request: &SendMessageRequest,
    ) -> Result<ConversationMessageDto, ApiError> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.send += 1;
            state.send_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (response, hook) = {
            let mut state = self.state.lock();
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(state.send_failure.clone());
            }
            if request.receiver_id == state.me {
                return Err(ApiError::Status {
                    status: 400,
                    message: Some("Cannot send a message to yourself".into()),
                });
            }
            state.next_id += 1;
            let next_id = state.next_id;
            let echo = state.echo_client_ids;
            let me = state.me.clone();
            let position = state
                .conversations
                .iter()
                .position(|c| c.counterparty_id == request.receiver_id);
            let index = if let Some(index) = position {
                index
            } else {
                state.conversations.push(StoredConversation {
                    id: ConversationId::new(format!("conv-{next_id}")),
                    role: Role::Buyer,
                    counterparty_id: request.receiver_id.clone(),
                    counterparty_name: request.receiver_id.to_string(),
                    messages: Vec::new(),
                    unread: 0,
                });
                state.conversations.len() - 1
            };
            let message = MessageDto {
                id: MessageId::new(format!("m-{next_id}")),
                sender_id: me,
                content: request.content.clone(),
                attachment_url: request.attachment_url.clone(),
                sent_at: Timestamp::now(),
                client_id: if echo { request.client_id.clone() } else { None },
            };
            let conversation = &mut state.conversations[index];
            conversation.messages.push(message.clone());
            let response = ConversationMessageDto {
                conversation_id: conversation.id.clone(),
                message,
            };
            (response, state.on_persist.clone())
        };

        if let Some(hook) = hook {
            hook(&response);
        }
        Ok(response)
    }

    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.mark_read += 1;
        match state
            .conversations
            .iter_mut()
            .find(|c| &c.id == conversation_id)
        {
            Some(conversation) => {
                conversation.unread = 0;
                Ok(())
            }
            None => Err(ApiError::Status {
                status: 404,
                message: Some("Conversation not found".into()),
            }),
        }
    }
}
