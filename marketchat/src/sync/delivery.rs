//! Delivery state machine for optimistic sends.
//!
//! ```text
//! Pending -> Sent -> Confirmed
//!              \---> Failed -> Pending (retry)
//!                       \----> removed (discard)
//! ```
//!
//! `Pending -> Sent` happens synchronously when the send call is handed off,
//! so the UI never renders a "sending" state. A rejected call only turns the
//! entry `Failed` once the grace delay has elapsed, and only if the same
//! attempt is still `Sent`; a confirmation that lands in the meantime wins.

use std::collections::HashMap;

use marketchat_proto::ids::{ClientMessageId, ConversationKey, UserId};
use marketchat_proto::message::Draft;

/// Visible delivery state of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    /// Created locally, send not yet handed off.
    Pending,
    /// Handed to the server, no confirmation yet.
    Sent,
    /// The server's authoritative copy has been observed. Terminal.
    Confirmed,
    /// The send was rejected; retry or discard.
    Failed,
}

impl DeliveryStatus {
    /// Whether `self -> to` is a legal transition.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Sent | Self::Confirmed)
                | (Self::Sent, Self::Confirmed | Self::Failed)
                | (Self::Failed, Self::Pending | Self::Confirmed)
        )
    }

    /// Short display symbol.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Pending | Self::Sent => "\u{2713}",
            Self::Confirmed => "\u{2713}\u{2713}",
            Self::Failed => "\u{2717}",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// An illegal status change was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid delivery transition {from} -> {to}")]
pub struct TransitionError {
    /// Current status.
    pub from: DeliveryStatus,
    /// Requested status.
    pub to: DeliveryStatus,
}

/// Errors from [`DeliveryTracker`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// No tracked send has this client id.
    #[error("unknown message {0}")]
    UnknownMessage(ClientMessageId),

    /// The requested change is not allowed from the current status.
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Everything needed to re-issue a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingSend {
    /// Local identity of the message.
    pub client_id: ClientMessageId,
    /// Conversation the message belongs to.
    pub conversation: ConversationKey,
    /// Recipient of the message.
    pub receiver: UserId,
    /// Payload, already normalized and validated.
    pub draft: Draft,
    /// 1 for the first attempt, incremented on every retry.
    pub attempt: u32,
}

#[derive(Debug, Clone)]
struct Entry {
    send: OutgoingSend,
    status: DeliveryStatus,
}

/// Tracks the delivery status of every optimistic send in a session.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    entries: HashMap<ClientMessageId, Entry>,
}

impl DeliveryTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new send in `Pending` with attempt 1.
    pub fn track(
        &mut self,
        client_id: ClientMessageId,
        conversation: ConversationKey,
        receiver: UserId,
        draft: Draft,
    ) -> OutgoingSend {
        let send = OutgoingSend {
            client_id: client_id.clone(),
            conversation,
            receiver,
            draft,
            attempt: 1,
        };
        self.entries.insert(
            client_id,
            Entry {
                send: send.clone(),
                status: DeliveryStatus::Pending,
            },
        );
        send
    }

    /// Current status of a tracked send.
    #[must_use]
    pub fn status(&self, client_id: &ClientMessageId) -> Option<DeliveryStatus> {
        self.entries.get(client_id).map(|e| e.status)
    }

    /// The tracked send for `client_id`.
    #[must_use]
    pub fn get(&self, client_id: &ClientMessageId) -> Option<&OutgoingSend> {
        self.entries.get(client_id).map(|e| &e.send)
    }

    /// `Pending -> Sent`.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the id is unknown or not `Pending`.
    pub fn mark_sent(&mut self, client_id: &ClientMessageId) -> Result<(), DeliveryError> {
        self.transition(client_id, DeliveryStatus::Sent)
    }

    /// Marks a send confirmed. Confirming twice is a no-op.
    ///
    /// Returns `true` if the status changed.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::UnknownMessage`] if the id is not tracked.
    pub fn confirm(&mut self, client_id: &ClientMessageId) -> Result<bool, DeliveryError> {
        let entry = self.entry_mut(client_id)?;
        if entry.status == DeliveryStatus::Confirmed {
            return Ok(false);
        }
        entry.status = DeliveryStatus::Confirmed;
        tracing::debug!(client_id = %client_id, attempt = entry.send.attempt, "send confirmed");
        Ok(true)
    }

    /// `Sent -> Failed`, but only if `attempt` is still the current attempt
    /// and it has not been confirmed in the meantime.
    ///
    /// Returns `true` if the entry is now `Failed`.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::UnknownMessage`] if the id is not tracked.
    pub fn fail_if_current(
        &mut self,
        client_id: &ClientMessageId,
        attempt: u32,
    ) -> Result<bool, DeliveryError> {
        let entry = self.entry_mut(client_id)?;
        if entry.send.attempt != attempt || entry.status != DeliveryStatus::Sent {
            tracing::debug!(
                client_id = %client_id,
                attempt,
                current_attempt = entry.send.attempt,
                status = %entry.status,
                "stale failure ignored"
            );
            return Ok(false);
        }
        entry.status = DeliveryStatus::Failed;
        Ok(true)
    }

    /// `Failed -> Pending` with the same client id and payload; the attempt
    /// counter is incremented.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the id is unknown or not `Failed`.
    pub fn retry(&mut self, client_id: &ClientMessageId) -> Result<OutgoingSend, DeliveryError> {
        self.transition(client_id, DeliveryStatus::Pending)?;
        let entry = self.entry_mut(client_id)?;
        entry.send.attempt += 1;
        Ok(entry.send.clone())
    }

    /// Removes a `Failed` send. Never contacts the server.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] if the id is unknown or not `Failed`.
    pub fn discard(&mut self, client_id: &ClientMessageId) -> Result<OutgoingSend, DeliveryError> {
        let status = self
            .status(client_id)
            .ok_or_else(|| DeliveryError::UnknownMessage(client_id.clone()))?;
        if status != DeliveryStatus::Failed {
            return Err(TransitionError {
                from: status,
                to: DeliveryStatus::Failed,
            }
            .into());
        }
        self.entries
            .remove(client_id)
            .map(|e| e.send)
            .ok_or_else(|| DeliveryError::UnknownMessage(client_id.clone()))
    }

    /// Moves every send addressed to `from` over to `to`.
    ///
    /// Returns the number of entries moved.
    pub fn rekey(&mut self, from: &ConversationKey, to: &ConversationKey) -> usize {
        let mut moved = 0;
        for entry in self.entries.values_mut() {
            if entry.send.conversation == *from {
                entry.send.conversation = to.clone();
                moved += 1;
            }
        }
        moved
    }

    /// Number of sends in the given status.
    #[must_use]
    pub fn count(&self, status: DeliveryStatus) -> usize {
        self.entries.values().filter(|e| e.status == status).count()
    }

    fn transition(
        &mut self,
        client_id: &ClientMessageId,
        to: DeliveryStatus,
    ) -> Result<(), DeliveryError> {
        let entry = self.entry_mut(client_id)?;
        if !entry.status.can_transition(to) {
            return Err(TransitionError {
                from: entry.status,
                to,
            }
            .into());
        }
        entry.status = to;
        Ok(())
    }

    fn entry_mut(&mut self, client_id: &ClientMessageId) -> Result<&mut Entry, DeliveryError> {
        self.entries
            .get_mut(client_id)
            .ok_or_else(|| DeliveryError::UnknownMessage(client_id.clone()))
    }
}
