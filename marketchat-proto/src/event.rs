//! Events exchanged over the persistent connection.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": {...}}`.
//! [`ServerEvent`] covers frames pushed by the server, [`ClientEvent`] frames
//! the client publishes.

use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, UserId};
use crate::presence::PresenceUpdate;
use crate::rest::ConversationMessageDto;
use crate::typing::{TypingNotice, TypingPhase};

/// Bearer credential carried by the `authenticate` frame.
///
/// `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wraps a raw bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Handshake accepted.
    Authenticated {
        /// Identity the server bound to this connection.
        user_id: UserId,
    },
    /// Handshake rejected.
    AuthError {
        /// Server-provided reason.
        reason: String,
    },
    /// A message was persisted in a conversation the user belongs to.
    NewMessage(ConversationMessageDto),
    /// Lightweight hint that a conversation has new activity.
    MessageNotification {
        /// Conversation with new activity.
        conversation_id: ConversationId,
        /// Who sent the message.
        sender_id: UserId,
    },
    /// A user came online or went offline.
    PresenceUpdate(PresenceUpdate),
    /// A counterparty started typing toward the current user.
    TypingStart(TypingNotice),
    /// A counterparty stopped typing.
    TypingStop(TypingNotice),
}

impl ServerEvent {
    /// The routing name of this event.
    #[must_use]
    pub const fn name(&self) -> EventName {
        match self {
            Self::Authenticated { .. } => EventName::Authenticated,
            Self::AuthError { .. } => EventName::AuthError,
            Self::NewMessage(_) => EventName::NewMessage,
            Self::MessageNotification { .. } => EventName::MessageNotification,
            Self::PresenceUpdate(_) => EventName::PresenceUpdate,
            Self::TypingStart(_) => EventName::TypingStart,
            Self::TypingStop(_) => EventName::TypingStop,
        }
    }

    /// Splits a typing event into its notice and phase.
    #[must_use]
    pub const fn as_typing(&self) -> Option<(&TypingNotice, TypingPhase)> {
        match self {
            Self::TypingStart(notice) => Some((notice, TypingPhase::Started)),
            Self::TypingStop(notice) => Some((notice, TypingPhase::Stopped)),
            _ => None,
        }
    }
}

/// Frames published by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// First frame on every connection.
    Authenticate {
        /// Bearer credential.
        token: AuthToken,
    },
    /// Announces the user as online after authentication.
    UserOnline {
        /// The signed-in user.
        user_id: UserId,
    },
    /// Enters a conversation room.
    JoinChat {
        /// Conversation to join.
        conversation_id: ConversationId,
    },
    /// Leaves a conversation room.
    LeaveChat {
        /// Conversation to leave.
        conversation_id: ConversationId,
    },
    /// The user started typing toward `receiver_id`.
    TypingStart {
        /// The counterparty being typed to.
        receiver_id: UserId,
    },
    /// The user stopped typing toward `receiver_id`.
    TypingStop {
        /// The counterparty being typed to.
        receiver_id: UserId,
    },
}

impl ClientEvent {
    /// The wire name of this event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::UserOnline { .. } => "user_online",
            Self::JoinChat { .. } => "join_chat",
            Self::LeaveChat { .. } => "leave_chat",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
        }
    }
}

/// Routing key for inbound events, used by subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventName {
    /// `authenticated`
    Authenticated,
    /// `auth_error`
    AuthError,
    /// `new_message`
    NewMessage,
    /// `message_notification`
    MessageNotification,
    /// `presence_update`
    PresenceUpdate,
    /// `typing_start`
    TypingStart,
    /// `typing_stop`
    TypingStop,
}

impl EventName {
    /// Every inbound event name.
    pub const ALL: [Self; 7] = [
        Self::Authenticated,
        Self::AuthError,
        Self::NewMessage,
        Self::MessageNotification,
        Self::PresenceUpdate,
        Self::TypingStart,
        Self::TypingStop,
    ];

    /// The wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authenticated => "authenticated",
            Self::AuthError => "auth_error",
            Self::NewMessage => "new_message",
            Self::MessageNotification => "message_notification",
            Self::PresenceUpdate => "presence_update",
            Self::TypingStart => "typing_start",
            Self::TypingStop => "typing_stop",
        }
    }

    /// Looks up a wire name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|n| n.as_str() == name)
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
