//! Integration tests for connection loss and recovery.
//!
//! When the socket drops, presence is cleared and every subscription dies
//! with the connection. After the supervisor reconnects, the session binds
//! its handlers again exactly once, rejoins the open room and refetches.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use marketchat::api::memory::InMemoryApi;
use marketchat::chat::{ChatConfig, ChatEvent, ChatSession};
use marketchat::connection::{ConnectionConfig, ConnectionEvent, ConnectionManager, Connectivity};
use marketchat::transport::loopback::{LoopbackConnector, LoopbackServer};
use marketchat::transport::{Credential, SharedCredential};

use marketchat_proto::event::{ClientEvent, ServerEvent};
use marketchat_proto::ids::{ConversationKey, UserId};
use marketchat_proto::presence::PresenceUpdate;
use marketchat_proto::rest::Role;

const BUYER: &str = "buyer-1";
const SELLER: &str = "seller-1";

/// Inbound event kinds a session subscribes to.
const SESSION_SUBSCRIPTIONS: usize = 5;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    session: ChatSession<InMemoryApi, LoopbackConnector>,
    events: mpsc::Receiver<ChatEvent>,
    api: InMemoryApi,
    server: LoopbackServer,
}

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

async fn next_matching(
    events: &mut mpsc::Receiver<ChatEvent>,
    predicate: impl Fn(&ChatEvent) -> bool,
) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(60), async {
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

fn is_connected(epoch: u64) -> impl Fn(&ChatEvent) -> bool {
    move |event| *event == ChatEvent::Connection(ConnectionEvent::Connected { epoch })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reconnect_rebinds_handlers_exactly_once() {
    let Harness {
        session,
        mut events,
        api,
        server,
    } = harness().await;
    let conversation = api.add_conversation(Role::Buyer, UserId::new(SELLER), "Seller");
    session.load_conversations(Role::Buyer).await.unwrap();
    session
        .open(ConversationKey::Durable(conversation.clone()))
        .await
        .unwrap();
    assert_eq!(session.connection().subscription_count(), SESSION_SUBSCRIPTIONS);

    assert!(server.drop_connection());
    next_matching(&mut events, |e| {
        matches!(e, ChatEvent::Connection(ConnectionEvent::Disconnected { .. }))
    })
    .await;
    assert_eq!(session.connection().subscription_count(), 0);

    next_matching(&mut events, is_connected(2)).await;
    assert_eq!(session.connection().subscription_count(), SESSION_SUBSCRIPTIONS);

    // A retry while already connected must not bind a second set.
    session.retry_connection().await.unwrap();
    assert_eq!(session.connection().subscription_count(), SESSION_SUBSCRIPTIONS);

    let pushed = api
        .seed_message(&conversation, UserId::new(SELLER), "Back online?")
        .unwrap();
    server.push(ServerEvent::NewMessage(pushed));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let thread = session.open_thread();
    assert_eq!(thread.len(), 1, "duplicate delivery: {thread:?}");
}

#[tokio::test(start_paused = true)]
async fn presence_is_cleared_when_connection_drops() {
    let Harness {
        session,
        mut events,
        api,
        server,
    } = harness().await;
    let seller = UserId::new(SELLER);
    api.add_conversation(Role::Buyer, seller.clone(), "Seller");
    session.load_conversations(Role::Buyer).await.unwrap();

    server.push(ServerEvent::PresenceUpdate(PresenceUpdate {
        user_id: seller.clone(),
        online: true,
    }));
    next_matching(&mut events, |e| {
        matches!(e, ChatEvent::PresenceChanged { online: true, .. })
    })
    .await;
    assert!(session.is_online(&seller));
    assert!(session.conversations()[0].counterparty.online);

    server.drop_connection();
    next_matching(&mut events, |e| *e == ChatEvent::PresenceCleared).await;
    assert!(!session.is_online(&seller));
    assert!(!session.conversations()[0].counterparty.online);
}

#[tokio::test(start_paused = true)]
async fn open_room_is_rejoined_and_refetched_after_reconnect() {
    let Harness {
        session,
        mut events,
        api,
        server,
    } = harness().await;
    let conversation = api.add_conversation(Role::Buyer, UserId::new(SELLER), "Seller");
    session.load_conversations(Role::Buyer).await.unwrap();
    session
        .open(ConversationKey::Durable(conversation.clone()))
        .await
        .unwrap();
    let fetches_before = api.calls().fetch;

    // Messages that arrived while offline only show up through the refetch.
    server.drop_connection();
    next_matching(&mut events, |e| *e == ChatEvent::PresenceCleared).await;
    api.seed_message(&conversation, UserId::new(SELLER), "Sent while you were away");
    server.clear_published();

    next_matching(&mut events, is_connected(2)).await;
    tokio::time::timeout(
        Duration::from_secs(5),
        server.wait_for_published(|published| {
            published.contains(&ClientEvent::JoinChat {
                conversation_id: conversation.clone(),
            })
        }),
    )
    .await
    .expect("join_chat after reconnect");

    next_matching(&mut events, |e| matches!(e, ChatEvent::ThreadUpdated { .. })).await;
    assert!(api.calls().fetch > fetches_before);
    assert_eq!(session.open_thread().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn connectivity_changes_are_forwarded() {
    let Harness {
        session: _session,
        mut events,
        server,
        ..
    } = harness().await;

    server.fail_next_connects(1);
    server.drop_connection();
    next_matching(&mut events, |e| {
        matches!(e, ChatEvent::Connection(ConnectionEvent::Disconnected { .. }))
    })
    .await;
    next_matching(&mut events, |e| {
        matches!(e, ChatEvent::Connection(ConnectionEvent::Reconnecting { .. }))
    })
    .await;
    next_matching(&mut events, |e| {
        *e == ChatEvent::Connectivity(Connectivity::Connected)
    })
    .await;
    assert!(server.is_client_connected());
}

#[tokio::test(start_paused = true)]
async fn logout_stops_reconnecting() {
    let Harness {
        session,
        mut events,
        server,
        ..
    } = harness().await;

    session.logout().await;
    next_matching(&mut events, |e| {
        *e == ChatEvent::Connectivity(Connectivity::Offline)
    })
    .await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!server.is_client_connected());
    assert_eq!(server.connect_count(), 1);
}
