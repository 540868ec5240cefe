//! Integration tests for failed sends.
//!
//! A rejected send stays visible as `Sent` for a short grace period, then
//! turns `Failed` with a readable reason. The user can retry it under the
//! same client id, or discard it locally.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use marketchat::api::ApiError;
use marketchat::api::memory::InMemoryApi;
use marketchat::chat::{ChatConfig, ChatError, ChatEvent, ChatSession};
use marketchat::connection::{ConnectionConfig, ConnectionManager};
use marketchat::sync::delivery::DeliveryStatus;
use marketchat::transport::loopback::LoopbackConnector;
use marketchat::transport::{Credential, SharedCredential};

use marketchat_proto::ids::UserId;
use marketchat_proto::message::Draft;

const BUYER: &str = "buyer-1";
const SELLER: &str = "0f6b7e8a-2d1c-4b7a-9a51-3f1f2e4d5c6b";
const GRACE: Duration = Duration::from_millis(1500);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn harness() -> (
    ChatSession<InMemoryApi, LoopbackConnector>,
    mpsc::Receiver<ChatEvent>,
    InMemoryApi,
) {
    let me = UserId::new(BUYER);
    let api = InMemoryApi::new(me.clone());
    let (connector, _server) = LoopbackConnector::create();
    let credential = SharedCredential::new(Credential::new(me.clone(), "token"));
    let connection =
        ConnectionManager::new(connector, Arc::new(credential), ConnectionConfig::default());
    let (session, events) = ChatSession::new(
        me,
        Arc::new(api.clone()),
        connection,
        ChatConfig {
            failure_grace: GRACE,
            event_buffer: 1024,
            ..ChatConfig::default()
        },
    );
    session.connect().await.expect("loopback connect");
    session
        .open_with(&UserId::new(SELLER), "Seller")
        .await
        .expect("open provisional conversation");
    (session, events, api)
}

async fn next_matching(
    events: &mut mpsc::Receiver<ChatEvent>,
    predicate: impl Fn(&ChatEvent) -> bool,
) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(30), async {
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

fn rejected(message: &str) -> ApiError {
    ApiError::Status {
        status: 422,
        message: Some(message.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rejected_send_fails_after_grace_then_retry_confirms() {
    let (session, mut events, api) = harness().await;
    api.fail_next_sends(1, rejected("Seller no longer available"));

    let started = Instant::now();
    let ticket = session.send(Draft::text("Hi")).await.unwrap();
    assert_eq!(session.status(&ticket.client_id), Some(DeliveryStatus::Sent));

    let failed = next_matching(&mut events, |e| matches!(e, ChatEvent::SendFailed { .. })).await;
    assert!(started.elapsed() >= GRACE);
    assert_eq!(
        failed,
        ChatEvent::SendFailed {
            client_id: ticket.client_id.clone(),
            reason: "This seller is no longer available.".to_string(),
        }
    );
    assert_eq!(session.status(&ticket.client_id), Some(DeliveryStatus::Failed));
    assert_eq!(session.open_thread()[0].status, DeliveryStatus::Failed);

    session.retry(&ticket.client_id).await.unwrap();
    assert_eq!(session.status(&ticket.client_id), Some(DeliveryStatus::Sent));
    let pending = next_matching(&mut events, |e| {
        matches!(e, ChatEvent::StatusChanged { .. })
    })
    .await;
    assert!(matches!(
        pending,
        ChatEvent::StatusChanged {
            status: DeliveryStatus::Pending,
            ..
        }
    ));

    next_matching(&mut events, |e| {
        matches!(
            e,
            ChatEvent::StatusChanged {
                status: DeliveryStatus::Confirmed,
                ..
            }
        )
    })
    .await;

    let thread = session.open_thread();
    assert_eq!(thread.len(), 1);
    assert!(thread[0].has_client_id(&ticket.client_id));
    assert_eq!(thread[0].status, DeliveryStatus::Confirmed);
    assert_eq!(api.calls().send, 2);
}

#[tokio::test(start_paused = true)]
async fn send_stays_sent_during_grace() {
    let (session, _events, api) = harness().await;
    api.fail_next_sends(1, ApiError::Timeout);

    let ticket = session.send(Draft::text("Hi")).await.unwrap();
    tokio::time::sleep(GRACE / 2).await;
    assert_eq!(session.status(&ticket.client_id), Some(DeliveryStatus::Sent));
    tokio::time::sleep(GRACE).await;
    assert_eq!(session.status(&ticket.client_id), Some(DeliveryStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn transport_level_failure_has_generic_reason() {
    let (session, mut events, api) = harness().await;
    api.fail_next_sends(1, ApiError::Timeout);

    session.send(Draft::text("Hi")).await.unwrap();
    let ChatEvent::SendFailed { reason, .. } =
        next_matching(&mut events, |e| matches!(e, ChatEvent::SendFailed { .. })).await
    else {
        unreachable!();
    };
    assert!(reason.contains("did not answer"), "{reason}");
}

#[tokio::test(start_paused = true)]
async fn discard_removes_failed_message_without_calls() {
    let (session, mut events, api) = harness().await;
    api.fail_next_sends(1, rejected("blocked by user"));

    let ticket = session.send(Draft::text("Hi")).await.unwrap();
    next_matching(&mut events, |e| matches!(e, ChatEvent::SendFailed { .. })).await;
    let calls_before = api.calls();

    session.discard(&ticket.client_id).unwrap();
    assert!(session.open_thread().is_empty());
    assert_eq!(session.status(&ticket.client_id), None);
    assert_eq!(api.calls(), calls_before);

    assert!(matches!(
        session.discard(&ticket.client_id),
        Err(ChatError::Delivery(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn only_failed_messages_can_be_retried_or_discarded() {
    let (session, _events, api) = harness().await;
    api.set_send_delay(Some(Duration::from_secs(60)));

    let ticket = session.send(Draft::text("Hi")).await.unwrap();
    assert!(matches!(
        session.retry(&ticket.client_id).await,
        Err(ChatError::Delivery(_))
    ));
    assert!(matches!(
        session.discard(&ticket.client_id),
        Err(ChatError::Delivery(_))
    ));
    assert_eq!(session.open_thread().len(), 1);
    assert_eq!(session.status(&ticket.client_id), Some(DeliveryStatus::Sent));
}

#[tokio::test(start_paused = true)]
async fn failure_of_one_send_leaves_others_alone() {
    let (session, mut events, api) = harness().await;
    api.fail_next_sends(1, rejected("listing removed"));

    let failing = session.send(Draft::text("first")).await.unwrap();
    let ok = session.send(Draft::text("second")).await.unwrap();
    next_matching(&mut events, |e| matches!(e, ChatEvent::SendFailed { .. })).await;

    assert_eq!(session.status(&failing.client_id), Some(DeliveryStatus::Failed));
    assert_eq!(session.status(&ok.client_id), Some(DeliveryStatus::Confirmed));
}
