//! Property-based tests for the socket codec and identifier parsing.
//!
//! Uses proptest to verify:
//! 1. Arbitrary text never panics the server-frame decoder.
//! 2. Frames with unknown event names are reported as `UnknownEvent`.
//! 3. Server frames survive encode → decode.
//! 4. Provisional keys round-trip through their text form; other keys are opaque.
//! 5. Draft validation accepts exactly the non-blank, in-bounds drafts.

use marketchat_proto::codec::{self, CodecError};
use marketchat_proto::event::{EventName, ServerEvent};
use marketchat_proto::ids::{
    ConversationId, ConversationKey, MessageId, Timestamp, UserId, PROVISIONAL_PREFIX,
};
use marketchat_proto::message::{Draft, MAX_CONTENT_SIZE, ValidationError};
use marketchat_proto::presence::PresenceUpdate;
use marketchat_proto::rest::{ConversationMessageDto, MessageDto};
use marketchat_proto::typing::TypingNotice;
use proptest::prelude::*;
use uuid::Uuid;

fn arb_user_id() -> impl Strategy<Value = UserId> {
    "[a-z0-9-]{1,36}".prop_map(UserId::new)
}

fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    (0i64..4_102_444_800_000).prop_map(Timestamp::from_millis)
}

fn arb_message_event() -> impl Strategy<Value = ServerEvent> {
    (
        "[a-z0-9]{1,24}",
        "[a-z0-9]{1,24}",
        arb_user_id(),
        proptest::option::of("[^\x00]{0,256}"),
        proptest::option::of("https://img\\.example/[a-z]{1,12}\\.png"),
        arb_timestamp(),
    )
        .prop_map(|(id, conv, sender, content, attachment, sent_at)| {
            ServerEvent::NewMessage(ConversationMessageDto {
                conversation_id: ConversationId::new(conv),
                message: MessageDto {
                    id: MessageId::new(id),
                    sender_id: sender,
                    content,
                    attachment_url: attachment,
                    sent_at,
                    client_id: None,
                },
            })
        })
}

fn arb_server_event() -> impl Strategy<Value = ServerEvent> {
    prop_oneof![
        arb_message_event(),
        ("[a-z0-9]{1,24}", arb_user_id()).prop_map(|(conv, sender)| {
            ServerEvent::MessageNotification {
                conversation_id: ConversationId::new(conv),
                sender_id: sender,
            }
        }),
        (arb_user_id(), any::<bool>())
            .prop_map(|(user_id, online)| ServerEvent::PresenceUpdate(PresenceUpdate {
                user_id,
                online
            })),
        arb_user_id().prop_map(|user_id| ServerEvent::TypingStart(TypingNotice { user_id })),
        arb_user_id().prop_map(|user_id| ServerEvent::TypingStop(TypingNotice { user_id })),
        ".{0,64}".prop_map(|reason| ServerEvent::AuthError { reason }),
    ]
}

proptest! {
    /// Arbitrary text never panics the decoder.
    #[test]
    fn random_text_decode_no_panic(text in ".{0,512}") {
        let _ = codec::decode_server(&text);
    }

    /// A well-formed frame with an unknown event name is never mistaken for a known event.
    #[test]
    fn unknown_event_names_are_rejected(name in "[a-z_]{1,24}") {
        prop_assume!(EventName::from_wire(&name).is_none());
        let frame = format!(r#"{{"event": "{name}", "data": {{}}}}"#);
        let is_unknown = matches!(codec::decode_server(&frame), Err(CodecError::UnknownEvent(n)) if n == name);
        prop_assert!(is_unknown);
    }

    /// Any server event survives an encode → decode round-trip.
    #[test]
    fn server_event_round_trip(event in arb_server_event()) {
        let text = codec::encode_server(&event).expect("encode should succeed");
        let decoded = codec::decode_server(&text).expect("decode should succeed");
        prop_assert_eq!(event, decoded);
    }

    /// Provisional keys survive Display → parse.
    #[test]
    fn provisional_key_round_trip(n in any::<u128>()) {
        let counterparty = UserId::new(Uuid::from_u128(n).hyphenated().to_string());
        let key = ConversationKey::provisional(counterparty);
        let parsed = ConversationKey::parse(&key.to_string()).expect("parse should succeed");
        prop_assert_eq!(parsed, key);
    }

    /// Keys without the provisional prefix are opaque durable ids.
    #[test]
    fn other_keys_are_durable(raw in "[a-zA-Z0-9]{1,32}") {
        prop_assume!(!raw.starts_with(PROVISIONAL_PREFIX));
        let key = ConversationKey::parse(&raw).expect("parse should succeed");
        prop_assert_eq!(key, ConversationKey::Durable(ConversationId::new(raw)));
    }

    /// Parsing arbitrary provisional suffixes never panics.
    #[test]
    fn provisional_parse_no_panic(suffix in ".{0,64}") {
        let _ = ConversationKey::parse(&format!("{PROVISIONAL_PREFIX}{suffix}"));
    }

    /// A normalized draft is valid iff it has some non-blank, in-bounds field.
    #[test]
    fn draft_validation_matches_content(content in "[ a-z]{0,64}") {
        let me = UserId::new("me");
        let them = UserId::new("them");
        let draft = Draft::text(content.clone()).normalized();
        let result = draft.validate(&me, &them);
        if content.trim().is_empty() {
            prop_assert_eq!(result, Err(ValidationError::Empty));
        } else {
            prop_assert!(content.len() <= MAX_CONTENT_SIZE);
            prop_assert_eq!(result, Ok(()));
        }
    }
}
