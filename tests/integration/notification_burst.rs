//! Integration tests for `message_notification` handling.
//!
//! A notification is only a hint: the session refetches the open
//! conversation and the list. Bursts of hints collapse into at most one
//! extra refetch, and overlapping refetches never duplicate messages.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use marketchat::api::memory::InMemoryApi;
use marketchat::chat::{ChatConfig, ChatEvent, ChatSession};
use marketchat::connection::{ConnectionConfig, ConnectionEvent, ConnectionManager};
use marketchat::transport::loopback::{LoopbackConnector, LoopbackServer};
use marketchat::transport::{Credential, SharedCredential};

use marketchat_proto::event::ServerEvent;
use marketchat_proto::ids::{ConversationId, ConversationKey, UserId};
use marketchat_proto::rest::Role;

const BUYER: &str = "buyer-1";
const SELLER: &str = "seller-1";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    session: ChatSession<InMemoryApi, LoopbackConnector>,
    events: mpsc::Receiver<ChatEvent>,
    api: InMemoryApi,
    server: LoopbackServer,
    conversation: ConversationId,
}

/// Connected session with one listed conversation, opened.
async fn harness() -> Harness {
    let me = UserId::new(BUYER);
    let api = InMemoryApi::new(me.clone());
    let conversation = api.add_conversation(Role::Buyer, UserId::new(SELLER), "Seller");
    let (connector, server) = LoopbackConnector::create();
    let credential = SharedCredential::new(Credential::new(me.clone(), "token"));
    let connection =
        ConnectionManager::new(connector, Arc::new(credential), ConnectionConfig::default());
    let (session, mut events) = ChatSession::new(
        me,
        Arc::new(api.clone()),
        connection,
        ChatConfig {
            event_buffer: 1024,
            ..ChatConfig::default()
        },
    );
    session.connect().await.expect("loopback connect");
    // Let the session finish reacting to the connect before measuring.
    tokio::time::timeout(Duration::from_secs(5), async {
        let connected = ChatEvent::Connection(ConnectionEvent::Connected { epoch: 1 });
        while events.recv().await.as_ref() != Some(&connected) {}
    })
    .await
    .expect("connected event");
    session
        .load_conversations(Role::Buyer)
        .await
        .expect("initial list");
    session
        .open(ConversationKey::Durable(conversation.clone()))
        .await
        .expect("open conversation");
    Harness {
        session,
        events,
        api,
        server,
        conversation,
    }
}

fn notification(conversation: &ConversationId, sender: &str) -> ServerEvent {
    ServerEvent::MessageNotification {
        conversation_id: conversation.clone(),
        sender_id: UserId::new(sender),
    }
}

async fn wait_until(events: &mut mpsc::Receiver<ChatEvent>, condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            events.recv().await.expect("event channel closed");
        }
    })
    .await
    .expect("timed out waiting for condition");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rapid_notifications_leave_no_duplicates() {
    let Harness {
        session,
        mut events,
        api,
        server,
        conversation,
    } = harness().await;
    let fetches_before = api.calls().fetch;
    api.set_fetch_delay(Some(Duration::from_millis(100)));

    api.seed_message(&conversation, UserId::new(SELLER), "first");
    server.push(notification(&conversation, SELLER));
    api.seed_message(&conversation, UserId::new(SELLER), "second");
    server.push(notification(&conversation, SELLER));

    wait_until(&mut events, || session.open_thread().len() == 2).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let thread = session.open_thread();
    assert_eq!(thread.len(), 2, "{thread:?}");
    let ids: HashSet<_> = thread.iter().filter_map(|m| m.server_id.clone()).collect();
    assert_eq!(ids.len(), 2);
    assert_eq!(
        thread
            .iter()
            .map(|m| m.content.as_deref().unwrap_or_default())
            .collect::<Vec<_>>(),
        vec!["first", "second"]
    );

    let refetches = api.calls().fetch - fetches_before;
    assert!(
        (1..=2).contains(&refetches),
        "expected coalesced refetches, got {refetches}"
    );
}

#[tokio::test(start_paused = true)]
async fn many_notifications_collapse_into_one_rerun() {
    let Harness {
        session,
        mut events,
        api,
        server,
        conversation,
    } = harness().await;
    let fetches_before = api.calls().fetch;
    api.set_fetch_delay(Some(Duration::from_millis(100)));

    for i in 0..10 {
        api.seed_message(&conversation, UserId::new(SELLER), format!("msg {i}"));
        server.push(notification(&conversation, SELLER));
    }

    wait_until(&mut events, || session.open_thread().len() == 10).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(session.open_thread().len(), 10);
    assert!(api.calls().fetch - fetches_before <= 2);
}

#[tokio::test(start_paused = true)]
async fn notification_for_background_conversation_refreshes_list_only() {
    let Harness {
        session,
        mut events,
        api,
        server,
        ..
    } = harness().await;
    let other = api.add_conversation(Role::Buyer, UserId::new("seller-2"), "Other seller");
    api.seed_message(&other, UserId::new("seller-2"), "Hello from another shop");
    let fetches_before = api.calls().fetch;

    server.push(notification(&other, "seller-2"));
    wait_until(&mut events, || {
        session
            .conversations()
            .iter()
            .any(|c| c.key == ConversationKey::Durable(other.clone()) && c.unread == 1)
    })
    .await;

    assert_eq!(session.total_unread(), 1);
    assert_eq!(api.calls().fetch, fetches_before);
    assert!(session.thread(&ConversationKey::Durable(other)).is_empty());
}
