//! Message reconciliation: one ordered, duplicate-free thread out of
//! optimistic sends, pushed messages, and REST snapshots.
//!
//! Every function here is pure. A merge only depends on the previous
//! merged sequence and the authoritative input, so overlapping refreshes
//! and push events can be applied in any order and any number of times.

use std::collections::{HashMap, HashSet};

use marketchat_proto::ids::{ClientMessageId, MessageId, UserId};
use marketchat_proto::rest::MessageDto;

use super::Message;
use super::delivery::DeliveryStatus;

/// Merge an authoritative `snapshot` into the `previous` merged sequence.
///
/// Rules:
/// - Duplicates inside `snapshot` collapse to their first occurrence.
/// - An authoritative message is matched to a previous entry by server id,
///   else by the client id the server echoed, else (for the current user's
///   own messages) to the oldest in-flight optimistic entry with the same
///   payload.
/// - A match carrying a client id keeps its local timestamp and client id,
///   fills content/attachment only where the local entry has none, gains the
///   server id, and becomes `Confirmed`.
/// - Anything else is inserted as the server sent it, `Confirmed`.
/// - Unmatched previous entries are kept: optimistic ones because they are
///   still in flight or failed, server-only ones because the snapshot may
///   predate them.
/// - The result is sorted by timestamp, ties broken by identity.
#[must_use]
pub fn merge(previous: &[Message], snapshot: &[MessageDto], me: &UserId) -> Vec<Message> {
    let mut by_server: HashMap<&MessageId, Vec<usize>> = HashMap::new();
    let mut by_client: HashMap<&ClientMessageId, usize> = HashMap::new();
    for (i, message) in previous.iter().enumerate() {
        if let Some(id) = &message.server_id {
            by_server.entry(id).or_default().push(i);
        }
        if let Some(id) = &message.client_id {
            by_client.entry(id).or_insert(i);
        }
    }

    let mut consumed = vec![false; previous.len()];
    let mut seen: HashSet<&MessageId> = HashSet::with_capacity(snapshot.len());
    let mut merged = Vec::with_capacity(previous.len() + snapshot.len());

    for dto in snapshot {
        if !seen.insert(&dto.id) {
            continue;
        }
        let same_id = by_server.get(&dto.id).map_or(&[][..], Vec::as_slice);
        let echoed = dto
            .client_id
            .as_ref()
            .and_then(|id| by_client.get(id))
            .copied()
            .filter(|&i| !consumed[i]);
        let optimistic = echoed
            .or_else(|| {
                same_id
                    .iter()
                    .copied()
                    .find(|&i| !consumed[i] && previous[i].client_id.is_some())
            })
            .or_else(|| {
                if same_id.is_empty() {
                    in_flight_match(previous, &consumed, dto, me)
                } else {
                    None
                }
            });

        for &i in same_id {
            consumed[i] = true;
        }
        match optimistic {
            Some(i) => {
                consumed[i] = true;
                merged.push(confirm(&previous[i], dto));
            }
            None => merged.push(Message::from_server(dto, me)),
        }
    }

    merged.extend(
        previous
            .iter()
            .zip(&consumed)
            .filter(|(_, consumed)| !**consumed)
            .map(|(message, _)| message.clone()),
    );
    sort(&mut merged);
    merged
}

/// Apply one pushed message; same rules as [`merge`].
#[must_use]
pub fn apply_push(previous: &[Message], pushed: &MessageDto, me: &UserId) -> Vec<Message> {
    merge(previous, std::slice::from_ref(pushed), me)
}

/// Attach the send response for `client_id` to its optimistic entry.
///
/// Any other entry already carrying the response's server id (a pushed copy
/// that beat the response) is collapsed into it. If the optimistic entry is
/// gone, the response is inserted as an authoritative message.
#[must_use]
pub fn confirm_send(
    previous: &[Message],
    client_id: &ClientMessageId,
    response: &MessageDto,
    me: &UserId,
) -> Vec<Message> {
    let mut merged: Vec<Message> = previous
        .iter()
        .filter(|m| !(m.has_server_id(&response.id) && !m.has_client_id(client_id)))
        .cloned()
        .collect();
    match merged.iter_mut().find(|m| m.has_client_id(client_id)) {
        Some(local) => *local = confirm(local, response),
        None => {
            tracing::debug!(
                client_id = %client_id,
                message_id = %response.id,
                "optimistic entry missing, inserting authoritative copy"
            );
            merged.push(Message::from_server(response, me));
        }
    }
    sort(&mut merged);
    merged
}

/// Sort by timestamp, then by identity key.
pub fn sort(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.key().cmp(&b.key()))
    });
}

/// The local entry `local` after the server confirmed it as `dto`.
fn confirm(local: &Message, dto: &MessageDto) -> Message {
    Message {
        server_id: Some(dto.id.clone()),
        client_id: local.client_id.clone(),
        sender_id: local.sender_id.clone(),
        content: local.content.clone().or_else(|| dto.content.clone()),
        attachment_url: local
            .attachment_url
            .clone()
            .or_else(|| dto.attachment_url.clone()),
        timestamp: local.timestamp,
        status: DeliveryStatus::Confirmed,
        is_own: local.is_own,
    }
}

/// Oldest unmatched in-flight send of ours whose payload equals `dto`.
///
/// Covers a push that arrives before the send response when the server
/// does not echo client ids.
fn in_flight_match(
    previous: &[Message],
    consumed: &[bool],
    dto: &MessageDto,
    me: &UserId,
) -> Option<usize> {
    if dto.sender_id != *me {
        return None;
    }
    previous
        .iter()
        .enumerate()
        .filter(|(i, m)| {
            !consumed[*i]
                && m.server_id.is_none()
                && m.client_id.is_some()
                && matches!(m.status, DeliveryStatus::Pending | DeliveryStatus::Sent)
                && m.same_payload(dto)
        })
        .min_by_key(|(_, m)| m.timestamp)
        .map(|(i, _)| i)
}
