//! REST data source for conversations and message history.
//!
//! [`ChatApi`] is the seam between the sync engine and the server's REST
//! contract. [`http::HttpApi`] talks to a real server; [`memory::InMemoryApi`]
//! is a server-like fake with call counters and failure injection.

pub mod http;
pub mod memory;

use marketchat_proto::ids::ConversationId;
use marketchat_proto::rest::{
    ConversationMessageDto, ConversationSummaryDto, MessageDto, Role, SendMessageRequest,
};

/// Errors returned by REST calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The request did not complete within the client timeout.
    #[error("request timed out")]
    Timeout,

    /// The server could not be reached or the connection failed.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-success status.
    #[error("server returned {status}{}", status_suffix(.message.as_deref()))]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error text from the response body, if any.
        message: Option<String>,
    },

    /// The response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// No credential is available (signed out).
    #[error("no credential available")]
    NoCredential,

    /// The client could not be constructed.
    #[error("invalid client configuration: {0}")]
    Config(String),
}

fn status_suffix(message: Option<&str>) -> String {
    message.map(|m| format!(": {m}")).unwrap_or_default()
}

impl ApiError {
    /// Server-provided error text, if any.
    #[must_use]
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Status { message, .. } => message.as_deref(),
            _ => None,
        }
    }
}

/// Async REST contract used by the sync engine.
///
/// Implementations read the bearer credential on every call.
pub trait ChatApi: Send + Sync + 'static {
    /// Full conversation list for `role`.
    fn list_conversations(
        &self,
        role: Role,
    ) -> impl std::future::Future<Output = Result<Vec<ConversationSummaryDto>, ApiError>> + Send;

    /// Conversations for `role` matching `query`.
    fn search_conversations(
        &self,
        role: Role,
        query: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ConversationSummaryDto>, ApiError>> + Send;

    /// Message history of one conversation, oldest first.
    fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> impl std::future::Future<Output = Result<Vec<MessageDto>, ApiError>> + Send;

    /// Send a message; the server creates the conversation if needed.
    fn send_message(
        &self,
        request: &SendMessageRequest,
    ) -> impl std::future::Future<Output = Result<ConversationMessageDto, ApiError>> + Send;

    /// Mark a conversation as read.
    fn mark_read(
        &self,
        conversation_id: &ConversationId,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send;
}
