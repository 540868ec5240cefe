//! Identifier and timestamp types shared by every layer.
//!
//! Server-assigned identifiers (users, conversations, messages) are opaque
//! strings. The only place where an identifier's format is checked is
//! [`ConversationKey::parse`], which extracts a counterparty id out of a
//! provisional key before it is used in a network call.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix marking a provisional conversation key (`new_<counterparty-uuid>`).
pub const PROVISIONAL_PREFIX: &str = "new_";

/// Identity of a user (buyer or seller).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a user identifier from its opaque string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this user ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable, server-assigned conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Creates a conversation identifier from its opaque string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this conversation ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authoritative, server-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a message identifier from its opaque string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this message ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Temporary identifier generated locally for an optimistic send.
///
/// Based on UUID v7 so that ids generated by one client sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientMessageId(Uuid);

impl ClientMessageId {
    /// Creates a new time-ordered client identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `ClientMessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ClientMessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp, serialized as RFC 3339.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    ///
    /// Out-of-range values clamp to the epoch.
    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        Self(
            Utc.timestamp_millis_opt(millis)
                .single()
                .unwrap_or_default(),
        )
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns the underlying chrono value.
    #[must_use]
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Error returned when a raw conversation key cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// The key was empty.
    #[error("conversation key is empty")]
    Empty,
    /// The counterparty part of a provisional key is not a valid identifier.
    #[error("malformed counterparty id in provisional key: {0:?}")]
    MalformedCounterparty(String),
}

/// Identity of a conversation: durable once the server has created the
/// thread, provisional (keyed by counterparty) before that.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    /// No thread exists yet; the conversation is addressed by counterparty.
    Provisional {
        /// The user the first message will be sent to.
        counterparty: UserId,
    },
    /// The server-assigned conversation id.
    Durable(ConversationId),
}

impl ConversationKey {
    /// Parses a raw key as produced by [`Display`](std::fmt::Display).
    ///
    /// Anything that is not `new_<uuid>` is treated as an opaque durable id.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Empty`] for an empty input, or
    /// [`KeyError::MalformedCounterparty`] if a provisional key does not
    /// carry a UUID-shaped counterparty id.
    pub fn parse(raw: &str) -> Result<Self, KeyError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(KeyError::Empty);
        }
        match raw.strip_prefix(PROVISIONAL_PREFIX) {
            Some(counterparty) => {
                Uuid::parse_str(counterparty)
                    .map_err(|_| KeyError::MalformedCounterparty(counterparty.to_string()))?;
                Ok(Self::Provisional {
                    counterparty: UserId::new(counterparty),
                })
            }
            None => Ok(Self::Durable(ConversationId::new(raw))),
        }
    }

    /// Builds a provisional key for the given counterparty.
    #[must_use]
    pub const fn provisional(counterparty: UserId) -> Self {
        Self::Provisional { counterparty }
    }

    /// Returns the durable conversation id, if one has been assigned.
    #[must_use]
    pub const fn durable_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Durable(id) => Some(id),
            Self::Provisional { .. } => None,
        }
    }

    /// Returns `true` if no server id has been assigned yet.
    #[must_use]
    pub const fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional { .. })
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisional { counterparty } => write!(f, "{PROVISIONAL_PREFIX}{counterparty}"),
            Self::Durable(id) => write!(f, "{id}"),
        }
    }
}

impl From<ConversationId> for ConversationKey {
    fn from(id: ConversationId) -> Self {
        Self::Durable(id)
    }
}
