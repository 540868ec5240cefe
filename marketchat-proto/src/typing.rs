//! Typing indicator payloads.

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Body of an inbound `typing_start` / `typing_stop` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    /// The user who is typing (or stopped typing) toward us.
    pub user_id: UserId,
}

/// Whether a typing burst started or ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypingPhase {
    /// The user started typing.
    Started,
    /// The user stopped typing.
    Stopped,
}
