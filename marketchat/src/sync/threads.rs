//! Per-conversation message sequences.
//!
//! [`MessageThreads`] owns the reconciled sequence of every conversation the
//! session has touched and applies optimistic inserts, snapshots, pushes and
//! send responses through the pure functions in [`super::reconcile`].

use std::collections::HashMap;

use marketchat_proto::ids::{ClientMessageId, ConversationKey, UserId};
use marketchat_proto::rest::MessageDto;

use super::Message;
use super::delivery::DeliveryStatus;
use super::reconcile;

/// Reconciled message sequences keyed by conversation.
#[derive(Debug, Default)]
pub struct MessageThreads {
    threads: HashMap<ConversationKey, Vec<Message>>,
}

impl MessageThreads {
    /// Creates an empty set of threads.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The sequence for `key`, oldest first. Empty if unknown.
    #[must_use]
    pub fn thread(&self, key: &ConversationKey) -> &[Message] {
        self.threads.get(key).map_or(&[][..], Vec::as_slice)
    }

    /// Whether any message is held for `key`.
    #[must_use]
    pub fn contains(&self, key: &ConversationKey) -> bool {
        self.threads.get(key).is_some_and(|t| !t.is_empty())
    }

    /// Appends an optimistic entry.
    pub fn insert_optimistic(&mut self, key: &ConversationKey, message: Message) {
        let thread = self.threads.entry(key.clone()).or_default();
        thread.push(message);
        reconcile::sort(thread);
    }

    /// Merges a REST snapshot. Returns the client ids confirmed by it.
    pub fn apply_snapshot(
        &mut self,
        key: &ConversationKey,
        snapshot: &[MessageDto],
        me: &UserId,
    ) -> Vec<ClientMessageId> {
        let merged = reconcile::merge(self.thread(key), snapshot, me);
        self.replace(key, merged)
    }

    /// Merges one pushed message. Returns the client ids confirmed by it.
    pub fn apply_push(
        &mut self,
        key: &ConversationKey,
        pushed: &MessageDto,
        me: &UserId,
    ) -> Vec<ClientMessageId> {
        let merged = reconcile::apply_push(self.thread(key), pushed, me);
        self.replace(key, merged)
    }

    /// Attaches a send response to the optimistic entry `client_id`.
    pub fn confirm_send(
        &mut self,
        key: &ConversationKey,
        client_id: &ClientMessageId,
        response: &MessageDto,
        me: &UserId,
    ) {
        let merged = reconcile::confirm_send(self.thread(key), client_id, response, me);
        self.threads.insert(key.clone(), merged);
    }

    /// Sets the status of the local entry `client_id`.
    ///
    /// A confirmed entry is never moved back. Returns `true` if changed.
    pub fn set_status(
        &mut self,
        key: &ConversationKey,
        client_id: &ClientMessageId,
        status: DeliveryStatus,
    ) -> bool {
        let Some(message) = self
            .threads
            .get_mut(key)
            .and_then(|t| t.iter_mut().find(|m| m.has_client_id(client_id)))
        else {
            return false;
        };
        if message.status == status || message.status == DeliveryStatus::Confirmed {
            return false;
        }
        message.status = status;
        true
    }

    /// Removes the local entry `client_id`.
    pub fn discard(&mut self, key: &ConversationKey, client_id: &ClientMessageId) -> Option<Message> {
        let thread = self.threads.get_mut(key)?;
        let index = thread.iter().position(|m| m.has_client_id(client_id))?;
        Some(thread.remove(index))
    }

    /// Moves the thread at `from` to `to`.
    ///
    /// If `to` already holds messages (pushes that arrived first), the two
    /// are combined without duplicates; optimistic entries win over
    /// server-only copies with the same server id.
    pub fn rekey(&mut self, from: &ConversationKey, to: &ConversationKey) {
        let Some(incoming) = self.threads.remove(from) else {
            return;
        };
        let target = self.threads.entry(to.clone()).or_default();
        for message in incoming {
            let same_server = message
                .server_id
                .as_ref()
                .and_then(|id| target.iter().position(|m| m.has_server_id(id)));
            let same_client = message
                .client_id
                .as_ref()
                .is_some_and(|id| target.iter().any(|m| m.has_client_id(id)));
            match same_server {
                Some(i) if message.client_id.is_some() && target[i].client_id.is_none() => {
                    target[i] = message;
                }
                Some(_) => {}
                None if same_client => {}
                None => target.push(message),
            }
        }
        reconcile::sort(target);
    }

    /// Drops every thread.
    pub fn clear(&mut self) {
        self.threads.clear();
    }

    fn replace(&mut self, key: &ConversationKey, merged: Vec<Message>) -> Vec<ClientMessageId> {
        let before = self.thread(key);
        let confirmed = merged
            .iter()
            .filter(|m| m.status == DeliveryStatus::Confirmed)
            .filter_map(|m| m.client_id.as_ref())
            .filter(|id| {
                before
                    .iter()
                    .find(|m| m.has_client_id(id))
                    .is_some_and(|m| m.status != DeliveryStatus::Confirmed)
            })
            .cloned()
            .collect();
        self.threads.insert(key.clone(), merged);
        confirmed
    }
}
