//! Client-side synchronization state.
//!
//! - [`reconcile`]: pure merge of local and authoritative message sequences.
//! - [`threads`]: per-conversation message sequences built on that merge.
//! - [`delivery`]: the optimistic-send state machine.
//! - [`conversations`]: the conversation list with unread aggregation.
//! - [`presence`]: online and typing indicators.

pub mod conversations;
pub mod delivery;
pub mod presence;
pub mod reconcile;
pub mod threads;

use marketchat_proto::ids::{ClientMessageId, MessageId, Timestamp, UserId};
use marketchat_proto::rest::MessageDto;

use delivery::DeliveryStatus;

/// One entry of a reconciled conversation thread.
///
/// At least one of `server_id` and `client_id` is always present. An
/// optimistic send starts with only a client id; the server id is attached
/// once the authoritative copy is observed, and the client id is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned id, once known.
    pub server_id: Option<MessageId>,
    /// Locally generated id for messages sent from this client.
    pub client_id: Option<ClientMessageId>,
    /// Author of the message.
    pub sender_id: UserId,
    /// Text body.
    pub content: Option<String>,
    /// Attachment URL.
    pub attachment_url: Option<String>,
    /// Local send time for optimistic messages, server time otherwise.
    pub timestamp: Timestamp,
    /// Delivery state.
    pub status: DeliveryStatus,
    /// Whether the current user wrote this message.
    pub is_own: bool,
}

/// Ordering key of a message among others with the same timestamp.
///
/// The client id is preferred so a confirmed message keeps its position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageKey<'a> {
    /// Keyed by local id.
    Client(&'a ClientMessageId),
    /// Keyed by server id.
    Server(&'a MessageId),
}

impl Message {
    /// An optimistic entry for a message the current user is sending.
    #[must_use]
    pub fn optimistic(
        client_id: ClientMessageId,
        sender_id: UserId,
        content: Option<String>,
        attachment_url: Option<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            server_id: None,
            client_id: Some(client_id),
            sender_id,
            content,
            attachment_url,
            timestamp,
            status: DeliveryStatus::Pending,
            is_own: true,
        }
    }

    /// The authoritative copy of a message, as confirmed by the server.
    ///
    /// An echoed client id is not carried over; it only identifies local
    /// entries, and this message has none.
    #[must_use]
    pub fn from_server(dto: &MessageDto, me: &UserId) -> Self {
        Self {
            server_id: Some(dto.id.clone()),
            client_id: None,
            sender_id: dto.sender_id.clone(),
            content: dto.content.clone(),
            attachment_url: dto.attachment_url.clone(),
            timestamp: dto.sent_at,
            status: DeliveryStatus::Confirmed,
            is_own: dto.sender_id == *me,
        }
    }

    /// Stable identity used to break timestamp ties.
    ///
    /// Returns `None` only for a malformed entry with neither id.
    #[must_use]
    pub fn key(&self) -> Option<MessageKey<'_>> {
        self.client_id
            .as_ref()
            .map(MessageKey::Client)
            .or_else(|| self.server_id.as_ref().map(MessageKey::Server))
    }

    /// Whether the server assigned `id` to this entry.
    #[must_use]
    pub fn has_server_id(&self, id: &MessageId) -> bool {
        self.server_id.as_ref() == Some(id)
    }

    /// Whether this entry was created locally with `id`.
    #[must_use]
    pub fn has_client_id(&self, id: &ClientMessageId) -> bool {
        self.client_id.as_ref() == Some(id)
    }

    /// Whether the text and attachment equal those of `dto`.
    #[must_use]
    pub fn same_payload(&self, dto: &MessageDto) -> bool {
        self.content == dto.content && self.attachment_url == dto.attachment_url
    }
}
