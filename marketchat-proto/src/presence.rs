//! Presence payloads carried by the persistent connection.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Online status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// User has an authenticated connection.
    Online,
    /// User has no connection.
    Offline,
}

impl PresenceStatus {
    /// Maps the wire boolean to a status.
    #[must_use]
    pub const fn from_online(online: bool) -> Self {
        if online { Self::Online } else { Self::Offline }
    }
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// `presence_update` event body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    /// The user whose presence changed.
    pub user_id: UserId,
    /// Whether the user is now online.
    pub online: bool,
}

impl PresenceUpdate {
    /// The update as a [`PresenceStatus`].
    #[must_use]
    pub const fn status(&self) -> PresenceStatus {
        PresenceStatus::from_online(self.online)
    }
}
