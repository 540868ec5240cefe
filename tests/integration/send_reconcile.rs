//! Integration tests for the optimistic send pipeline.
//!
//! A message is shown at once, reconciled with the server's copy (from the
//! send response, a push, or a refetch, in any order), and always ends up as
//! exactly one entry that keeps its local identity and timestamp.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use marketchat::api::memory::InMemoryApi;
use marketchat::chat::{ChatConfig, ChatEvent, ChatSession};
use marketchat::connection::{ConnectionConfig, ConnectionEvent, ConnectionManager};
use marketchat::sync::delivery::DeliveryStatus;
use marketchat::transport::loopback::{LoopbackConnector, LoopbackServer};
use marketchat::transport::{Credential, SharedCredential};

use marketchat_proto::event::ServerEvent;
use marketchat_proto::ids::{ConversationKey, UserId};
use marketchat_proto::message::Draft;
use marketchat_proto::rest::Role;

const BUYER: &str = "buyer-1";
const SELLER: &str = "0f6b7e8a-2d1c-4b7a-9a51-3f1f2e4d5c6b";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Session = ChatSession<InMemoryApi, LoopbackConnector>;

struct Harness {
    session: Session,
    events: mpsc::Receiver<ChatEvent>,
    api: InMemoryApi,
    server: LoopbackServer,
}

/// Build a connected session for `BUYER` backed by the in-memory API.
async fn harness() -> Harness {
    let me = UserId::new(BUYER);
    let api = InMemoryApi::new(me.clone());
    let (connector, server) = LoopbackConnector::create();
    let credential = SharedCredential::new(Credential::new(me.clone(), "token"));
    let connection =
        ConnectionManager::new(connector, Arc::new(credential), ConnectionConfig::default());
    let (session, events) = ChatSession::new(
        me,
        Arc::new(api.clone()),
        connection,
        ChatConfig {
            event_buffer: 1024,
            ..ChatConfig::default()
        },
    );
    session.connect().await.expect("loopback connect");
    Harness {
        session,
        events,
        api,
        server,
    }
}

/// Wait for the first event matching `predicate`, skipping others.
async fn next_matching(
    events: &mut mpsc::Receiver<ChatEvent>,
    predicate: impl Fn(&ChatEvent) -> bool,
) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for chat event")
}

/// Consume events until `condition` holds.
async fn wait_until(events: &mut mpsc::Receiver<ChatEvent>, condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            events.recv().await.expect("event channel closed");
        }
    })
    .await
    .expect("timed out waiting for condition");
}

fn is_confirmed(event: &ChatEvent) -> bool {
    matches!(
        event,
        ChatEvent::StatusChanged {
            status: DeliveryStatus::Confirmed,
            ..
        }
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_message_to_new_counterparty_reconciles_to_one_confirmed_entry() {
    let Harness {
        session,
        mut events,
        api,
        ..
    } = harness().await;
    let seller = UserId::new(SELLER);

    session.open_with(&seller, "Seller").await.unwrap();
    let ticket = session.send(Draft::text("Hi")).await.unwrap();
    assert_eq!(ticket.conversation, ConversationKey::provisional(seller.clone()));

    let optimistic = session.open_thread();
    assert_eq!(optimistic.len(), 1);
    assert_eq!(optimistic[0].status, DeliveryStatus::Sent);
    let local_timestamp = optimistic[0].timestamp;

    next_matching(&mut events, is_confirmed).await;

    let conversation_id = api.conversation_with(&seller).unwrap();
    let server_copy = api.messages(&conversation_id).remove(0);
    let durable = ConversationKey::Durable(conversation_id.clone());
    assert_eq!(session.open_key(), Some(durable.clone()));

    let thread = session.open_thread();
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].status, DeliveryStatus::Confirmed);
    assert_eq!(thread[0].server_id.as_ref(), Some(&server_copy.id));
    assert!(thread[0].has_client_id(&ticket.client_id));
    assert_eq!(thread[0].timestamp, local_timestamp);

    let keys: Vec<_> = session.conversations().into_iter().map(|c| c.key).collect();
    assert_eq!(keys, vec![durable]);

    // Refetching the same history changes nothing.
    session.refresh_open().await.unwrap();
    session.refresh_open().await.unwrap();
    assert_eq!(session.open_thread(), thread);
}

#[tokio::test]
async fn push_racing_the_send_response_leaves_one_entry() {
    let Harness {
        session,
        mut events,
        api,
        server,
    } = harness().await;
    let seller = UserId::new(SELLER);
    let push_server = server.clone();
    api.on_persist(move |dto| {
        push_server.push(ServerEvent::NewMessage(dto.clone()));
    });

    session.open_with(&seller, "Seller").await.unwrap();
    let ticket = session.send(Draft::text("Is this still available?")).await.unwrap();
    next_matching(&mut events, is_confirmed).await;

    // Let the pushed copy be dispatched whichever way round it landed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.refresh_open().await.unwrap();

    let thread = session.open_thread();
    assert_eq!(thread.len(), 1, "duplicate entries: {thread:?}");
    assert!(thread[0].has_client_id(&ticket.client_id));
    assert_eq!(thread[0].status, DeliveryStatus::Confirmed);
}

#[tokio::test]
async fn echoed_client_id_matches_pushed_copy() {
    let Harness {
        session,
        mut events,
        api,
        server,
    } = harness().await;
    let seller = UserId::new(SELLER);
    let conversation = api.add_conversation(Role::Buyer, seller.clone(), "Seller");
    session.load_conversations(Role::Buyer).await.unwrap();
    session
        .open(ConversationKey::Durable(conversation))
        .await
        .unwrap();

    api.echo_client_ids(true);
    api.set_send_delay(Some(Duration::from_millis(200)));
    let push_server = server.clone();
    api.on_persist(move |dto| {
        push_server.push(ServerEvent::NewMessage(dto.clone()));
    });

    let first = session.send(Draft::text("Same text")).await.unwrap();
    let second = session.send(Draft::text("Same text")).await.unwrap();
    next_matching(&mut events, is_confirmed).await;
    next_matching(&mut events, is_confirmed).await;

    let thread = session.open_thread();
    assert_eq!(thread.len(), 2);
    assert!(thread.iter().any(|m| m.has_client_id(&first.client_id)));
    assert!(thread.iter().any(|m| m.has_client_id(&second.client_id)));
    assert!(thread.iter().all(|m| m.status == DeliveryStatus::Confirmed));
    assert_ne!(thread[0].server_id, thread[1].server_id);
}

#[tokio::test]
async fn incoming_message_in_open_conversation_is_appended() {
    let Harness {
        session,
        mut events,
        api,
        server,
    } = harness().await;
    let seller = UserId::new(SELLER);
    let conversation = api.add_conversation(Role::Buyer, seller.clone(), "Seller");
    session.load_conversations(Role::Buyer).await.unwrap();
    let key = ConversationKey::Durable(conversation.clone());
    session.open(key).await.unwrap();

    let pushed = api
        .seed_message(&conversation, seller.clone(), "Yes, still available")
        .unwrap();
    server.push(ServerEvent::NewMessage(pushed.clone()));
    wait_until(&mut events, || session.open_thread().len() == 1).await;

    let thread = session.open_thread();
    assert_eq!(thread.len(), 1);
    assert!(!thread[0].is_own);
    assert_eq!(thread[0].server_id.as_ref(), Some(&pushed.message.id));
    assert_eq!(thread[0].status, DeliveryStatus::Confirmed);

    // The same push delivered twice is merged once.
    server.push(ServerEvent::NewMessage(pushed));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.open_thread().len(), 1);
}

#[tokio::test]
async fn message_in_background_conversation_bumps_unread_and_order() {
    let Harness {
        session,
        mut events,
        api,
        server,
    } = harness().await;
    let first = api.add_conversation(Role::Buyer, UserId::new("seller-a"), "Lamps");
    let second = api.add_conversation(Role::Buyer, UserId::new("seller-b"), "Chairs");
    api.seed_message(&first, UserId::new(BUYER), "Hello lamps");
    session.load_conversations(Role::Buyer).await.unwrap();
    session
        .open(ConversationKey::Durable(first.clone()))
        .await
        .unwrap();

    let pushed = api
        .seed_message(&second, UserId::new("seller-b"), "New chair in stock")
        .unwrap();
    server.push(ServerEvent::NewMessage(pushed));
    next_matching(&mut events, |e| {
        matches!(e, ChatEvent::ConversationsChanged { total_unread: 1 })
    })
    .await;

    let conversations = session.conversations();
    assert_eq!(conversations[0].key, ConversationKey::Durable(second));
    assert_eq!(conversations[0].unread, 1);
    assert_eq!(
        conversations[0]
            .last_message
            .as_ref()
            .and_then(|m| m.content.as_deref()),
        Some("New chair in stock")
    );
    assert!(session.thread(&conversations[0].key).is_empty());
}

#[tokio::test(start_paused = true)]
async fn history_of_a_conversation_left_behind_is_dropped() {
    let Harness {
        session,
        mut events,
        api,
        ..
    } = harness().await;
    next_matching(&mut events, |e| {
        *e == ChatEvent::Connection(ConnectionEvent::Connected { epoch: 1 })
    })
    .await;
    let lamps = api.add_conversation(Role::Buyer, UserId::new("seller-a"), "Lamps");
    let chairs = api.add_conversation(Role::Buyer, UserId::new("seller-b"), "Chairs");
    api.seed_message(&lamps, UserId::new("seller-a"), "Lamp still available");
    api.seed_message(&chairs, UserId::new("seller-b"), "Chair sold");
    session.load_conversations(Role::Buyer).await.unwrap();
    let lamps_key = ConversationKey::Durable(lamps);
    let chairs_key = ConversationKey::Durable(chairs);

    api.set_fetch_delay(Some(Duration::from_millis(500)));
    let slow_open = tokio::spawn({
        let session = session.clone();
        let key = lamps_key.clone();
        async move { session.open(key).await }
    });
    // Let the first open reach its (slow) history fetch.
    tokio::time::sleep(Duration::from_millis(10)).await;
    api.set_fetch_delay(None);
    session.open(chairs_key.clone()).await.unwrap();

    slow_open.await.unwrap().unwrap();
    assert_eq!(session.open_key(), Some(chairs_key.clone()));
    assert!(session.thread(&lamps_key).is_empty());
    assert_eq!(session.thread(&chairs_key).len(), 1);
    assert_eq!(api.calls().fetch, 2);
}
