//! Property-based tests for message reconciliation.
//!
//! Uses proptest to verify:
//! 1. Merging the same snapshot twice changes nothing.
//! 2. No authoritative message and no optimistic send is lost or duplicated.
//! 3. The merged thread is always sorted by timestamp.
//! 4. Pushes from other users converge regardless of arrival order.
//! 5. Merging a snapshot in two steps equals merging it at once.

use std::collections::HashSet;

use marketchat::sync::Message;
use marketchat::sync::delivery::DeliveryStatus;
use marketchat::sync::reconcile::{apply_push, merge};
use marketchat_proto::ids::{ClientMessageId, MessageId, Timestamp, UserId};
use marketchat_proto::rest::MessageDto;
use proptest::prelude::*;
use uuid::Uuid;

const ME: &str = "me";
const OTHER: &str = "seller";

fn me() -> UserId {
    UserId::new(ME)
}

/// Short payloads from a tiny alphabet, so payload collisions are common.
fn arb_content() -> impl Strategy<Value = String> {
    "[ab]{1,2}"
}

fn arb_millis() -> impl Strategy<Value = i64> {
    0i64..50
}

/// In-flight optimistic sends with unique client ids.
fn arb_optimistic() -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec((arb_content(), arb_millis()), 0..8).prop_map(|entries| {
        entries
            .into_iter()
            .enumerate()
            .map(|(i, (content, at))| {
                let mut message = Message::optimistic(
                    ClientMessageId::from_uuid(Uuid::from_u128(i as u128 + 1)),
                    me(),
                    Some(content),
                    None,
                    Timestamp::from_millis(at),
                );
                message.status = DeliveryStatus::Sent;
                message
            })
            .collect()
    })
}

/// Server messages; ids repeat so snapshots contain duplicates.
fn arb_snapshot() -> impl Strategy<Value = Vec<MessageDto>> {
    prop::collection::vec(
        (0u8..12, prop::bool::ANY, arb_content(), arb_millis()),
        0..12,
    )
    .prop_map(|entries| {
        entries
            .into_iter()
            .map(|(id, mine, content, at)| MessageDto {
                id: MessageId::new(format!("m{id}")),
                sender_id: UserId::new(if mine { ME } else { OTHER }),
                content: Some(content),
                attachment_url: None,
                sent_at: Timestamp::from_millis(at),
                client_id: None,
            })
            .collect()
    })
}

/// Messages from the counterparty with distinct ids.
fn arb_incoming() -> impl Strategy<Value = Vec<MessageDto>> {
    prop::collection::vec((arb_content(), arb_millis()), 0..10).prop_map(|entries| {
        entries
            .into_iter()
            .enumerate()
            .map(|(i, (content, at))| MessageDto {
                id: MessageId::new(format!("in{i}")),
                sender_id: UserId::new(OTHER),
                content: Some(content),
                attachment_url: None,
                sent_at: Timestamp::from_millis(at),
                client_id: None,
            })
            .collect()
    })
}

fn is_sorted(messages: &[Message]) -> bool {
    messages.windows(2).all(|w| w[0].timestamp <= w[1].timestamp)
}

proptest! {
    #[test]
    fn merge_is_idempotent(previous in arb_optimistic(), snapshot in arb_snapshot()) {
        let once = merge(&previous, &snapshot, &me());
        let twice = merge(&once, &snapshot, &me());
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn merge_loses_and_duplicates_nothing(
        previous in arb_optimistic(),
        snapshot in arb_snapshot(),
    ) {
        let merged = merge(&previous, &snapshot, &me());

        let distinct: HashSet<&MessageId> = snapshot.iter().map(|dto| &dto.id).collect();
        for id in &distinct {
            let copies = merged.iter().filter(|m| m.has_server_id(id)).count();
            prop_assert_eq!(copies, 1, "server id {} appears {} times", id, copies);
        }
        for local in &previous {
            let client_id = local.client_id.as_ref().unwrap();
            let copies = merged.iter().filter(|m| m.has_client_id(client_id)).count();
            prop_assert_eq!(copies, 1);
        }

        // Every entry is either an optimistic send or a snapshot message.
        let optimistic_only = merged.iter().filter(|m| m.server_id.is_none()).count();
        prop_assert_eq!(merged.len(), distinct.len() + optimistic_only);
        prop_assert!(merged.iter().all(|m| m.key().is_some()));
    }

    #[test]
    fn merged_thread_is_sorted(previous in arb_optimistic(), snapshot in arb_snapshot()) {
        prop_assert!(is_sorted(&merge(&previous, &snapshot, &me())));
    }

    #[test]
    fn confirmed_sends_keep_their_local_timestamp(
        previous in arb_optimistic(),
        snapshot in arb_snapshot(),
    ) {
        let merged = merge(&previous, &snapshot, &me());
        for local in &previous {
            let client_id = local.client_id.as_ref().unwrap();
            let entry = merged.iter().find(|m| m.has_client_id(client_id)).unwrap();
            prop_assert_eq!(entry.timestamp, local.timestamp);
            prop_assert_eq!(&entry.content, &local.content);
            prop_assert!(entry.is_own);
        }
    }

    #[test]
    fn incoming_pushes_converge_in_any_order(
        (incoming, shuffled) in arb_incoming()
            .prop_flat_map(|incoming| (Just(incoming.clone()), Just(incoming).prop_shuffle())),
    ) {
        let in_order = incoming
            .iter()
            .fold(Vec::new(), |thread, dto| apply_push(&thread, dto, &me()));
        let out_of_order = shuffled
            .iter()
            .fold(Vec::new(), |thread, dto| apply_push(&thread, dto, &me()));
        prop_assert_eq!(&in_order, &out_of_order);
        prop_assert_eq!(in_order, merge(&[], &incoming, &me()));
    }

    #[test]
    fn snapshot_merged_in_two_steps_equals_one_step(
        previous in arb_optimistic(),
        snapshot in arb_snapshot(),
        split in 0usize..12,
    ) {
        let split = split.min(snapshot.len());
        let partial = merge(&previous, &snapshot[..split], &me());
        let stepped = merge(&partial, &snapshot, &me());
        prop_assert_eq!(stepped, merge(&previous, &snapshot, &me()));
    }
}
