//! REST data-transfer objects.
//!
//! Field names follow the server's camelCase JSON. `clientId` is an optional
//! echo of [`ClientMessageId`]; servers that do not echo it simply omit it.

use serde::{Deserialize, Serialize};

use crate::ids::{ClientMessageId, ConversationId, MessageId, Timestamp, UserId};

/// Which side of the marketplace the conversation list is projected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Conversations where the current user is the buyer.
    Buyer,
    /// Conversations where the current user is the seller.
    Seller,
}

impl Role {
    /// Query-string form of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buyer => "buyer",
            Self::Seller => "seller",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a [`Role`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role {0:?} (expected \"buyer\" or \"seller\")")]
pub struct UnknownRole(pub String);

impl std::str::FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buyer" => Ok(Self::Buyer),
            "seller" => Ok(Self::Seller),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Preview of the newest message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessageDto {
    /// Server id of the message.
    pub id: MessageId,
    /// Text content, if any.
    #[serde(default)]
    pub content: Option<String>,
    /// When the message was sent.
    pub timestamp: Timestamp,
    /// Who sent it.
    pub sender_id: UserId,
}

/// One entry of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummaryDto {
    /// Durable conversation id.
    pub id: ConversationId,
    /// The other participant.
    pub counterparty_id: UserId,
    /// Display name of the other participant.
    pub counterparty_name: String,
    /// Newest message, if the thread has any.
    #[serde(default)]
    pub last_message: Option<LastMessageDto>,
    /// Messages not yet read by the current user.
    #[serde(default)]
    pub unread_count: u32,
}

/// A message as returned by the history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    /// Authoritative server id.
    pub id: MessageId,
    /// Who sent it.
    pub sender_id: UserId,
    /// Text content, if any.
    #[serde(default)]
    pub content: Option<String>,
    /// Attachment URL, if any.
    #[serde(default)]
    pub attachment_url: Option<String>,
    /// Server timestamp.
    pub sent_at: Timestamp,
    /// Echo of the sender's temporary id, when the server provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientMessageId>,
}

/// A message together with the conversation it belongs to.
///
/// Returned by the send endpoint and carried by the `new_message` push event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessageDto {
    /// Conversation the message belongs to (possibly newly created).
    pub conversation_id: ConversationId,
    /// The message itself.
    #[serde(flatten)]
    pub message: MessageDto,
}

/// Body of the send-message request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    /// Counterparty the message is addressed to.
    pub receiver_id: UserId,
    /// Text content, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Attachment URL, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    /// Temporary id, for servers that echo it back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientMessageId>,
}

/// Error body returned by the server on non-2xx responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorBody {
    /// Human-oriented error string.
    pub error: Option<String>,
    /// Alternative field some endpoints use.
    pub message: Option<String>,
}

impl ErrorBody {
    /// Returns whichever error text the server provided.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.error.as_deref().or(self.message.as_deref())
    }
}
