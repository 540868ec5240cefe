//! Integration tests for the WebSocket transport against a local server.
//!
//! The mock server speaks the real wire format: it expects `authenticate`
//! as the first frame, answers `authenticated` or `auth_error`, records
//! every client frame and writes whatever text frames a test pushes.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use marketchat::connection::{ConnectionConfig, ConnectionManager};
use marketchat::transport::websocket::WsConnector;
use marketchat::transport::{
    Connector, Credential, SharedCredential, Socket, TransportError, TransportType,
};

use marketchat_proto::codec;
use marketchat_proto::event::{ClientEvent, EventName, ServerEvent};
use marketchat_proto::ids::{ConversationId, UserId};
use marketchat_proto::presence::PresenceUpdate;

const USER: &str = "buyer-1";
const REJECTED_TOKEN: &str = "bad";

// ---------------------------------------------------------------------------
// Mock server
// ---------------------------------------------------------------------------

struct MockServer {
    url: String,
    /// Frames received from the client after the handshake.
    received: mpsc::UnboundedReceiver<ClientEvent>,
    /// Raw text frames to write to the client.
    push: mpsc::UnboundedSender<String>,
}

impl MockServer {
    /// Accepts a single connection on an ephemeral port.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (push, mut push_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws_stream = tokio_tungstenite::accept_async(stream).await.unwrap();

            let Some(Ok(Message::Text(first))) = ws_stream.next().await else {
                return;
            };
            let Ok(ClientEvent::Authenticate { token }) = codec::decode_client(first.as_str())
            else {
                return;
            };
            if token.expose() == REJECTED_TOKEN {
                let reply = codec::encode_server(&ServerEvent::AuthError {
                    reason: "token expired".to_string(),
                })
                .unwrap();
                let _ = ws_stream.send(Message::text(reply)).await;
                let _ = ws_stream.close(None).await;
                return;
            }
            let reply = codec::encode_server(&ServerEvent::Authenticated {
                user_id: UserId::new(USER),
            })
            .unwrap();
            ws_stream.send(Message::text(reply)).await.unwrap();

            loop {
                tokio::select! {
                    frame = ws_stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(event) = codec::decode_client(text.as_str()) {
                                let _ = received_tx.send(event);
                            }
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    },
                    pushed = push_rx.recv() => match pushed {
                        Some(text) => {
                            if ws_stream.send(Message::text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Self {
            url: format!("ws://{addr}/socket"),
            received,
            push,
        }
    }

    fn push_event(&self, event: &ServerEvent) {
        self.push.send(codec::encode_server(event).unwrap()).unwrap();
    }

    fn push_raw(&self, text: &str) {
        self.push.send(text.to_string()).unwrap();
    }

    async fn next_received(&mut self) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("timed out waiting for client frame")
            .expect("server task ended")
    }
}

fn credential(token: &str) -> Credential {
    Credential::new(UserId::new(USER), token)
}

fn presence(user: &str, online: bool) -> ServerEvent {
    ServerEvent::PresenceUpdate(PresenceUpdate {
        user_id: UserId::new(user),
        online,
    })
}

async fn recv_event(socket: &impl Socket) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), socket.recv())
        .await
        .expect("timed out waiting for server event")
        .expect("socket closed")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_then_frames_flow_both_ways() {
    let mut server = MockServer::start().await;
    let connector = WsConnector::new(&server.url).unwrap();

    let socket = connector.connect(&credential("token")).await.unwrap();
    assert!(socket.is_connected());
    assert_eq!(socket.transport_type(), TransportType::WebSocket);

    let join = ClientEvent::JoinChat {
        conversation_id: ConversationId::new("conv-7"),
    };
    socket.send(&join).await.unwrap();
    assert_eq!(server.next_received().await, join);

    server.push_event(&presence("seller-1", true));
    assert_eq!(recv_event(&socket).await, presence("seller-1", true));

    socket.close().await;
    assert!(!socket.is_connected());
    assert!(matches!(
        socket.send(&join).await,
        Err(TransportError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn rejected_token_fails_the_handshake() {
    let server = MockServer::start().await;
    let connector = WsConnector::new(&server.url).unwrap();

    let result = connector.connect(&credential(REJECTED_TOKEN)).await;
    match result {
        Err(TransportError::AuthRejected(reason)) => assert_eq!(reason, "token expired"),
        Err(other) => panic!("expected AuthRejected, got {other:?}"),
        Ok(_) => panic!("expected AuthRejected, got a socket"),
    }
}

#[tokio::test]
async fn unknown_and_malformed_frames_are_skipped() {
    let server = MockServer::start().await;
    let connector = WsConnector::new(&server.url).unwrap();
    let socket = connector.connect(&credential("token")).await.unwrap();

    server.push_raw(r#"{"event":"listing_sold","data":{}}"#);
    server.push_raw("not json at all");
    server.push_event(&presence("seller-1", false));

    assert_eq!(recv_event(&socket).await, presence("seller-1", false));
    assert!(socket.is_connected());
}

#[tokio::test]
async fn server_close_is_detected() {
    let server = MockServer::start().await;
    let connector = WsConnector::new(&server.url).unwrap();
    let socket = connector.connect(&credential("token")).await.unwrap();

    // Dropping the push handle ends the server loop, which drops the stream.
    drop(server);
    let result = tokio::time::timeout(Duration::from_secs(5), socket.recv())
        .await
        .expect("timed out waiting for close");
    assert!(matches!(result, Err(TransportError::ConnectionClosed)));
    assert!(!socket.is_connected());
}

#[tokio::test]
async fn manager_announces_user_and_routes_pushes() {
    let mut server = MockServer::start().await;
    let connector = WsConnector::new(&server.url).unwrap();
    let credentials = SharedCredential::new(credential("token"));
    let manager =
        ConnectionManager::new(connector, Arc::new(credentials), ConnectionConfig::default());

    assert_eq!(manager.connect().await.unwrap(), 1);
    assert_eq!(
        server.next_received().await,
        ClientEvent::UserOnline {
            user_id: UserId::new(USER),
        }
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.subscribe(EventName::PresenceUpdate, move |event| {
        let _ = tx.send(event.clone());
    });

    server.push_event(&presence("seller-1", true));
    let routed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for routed event")
        .unwrap();
    assert_eq!(routed, presence("seller-1", true));

    let typing = ClientEvent::TypingStart {
        receiver_id: UserId::new("seller-1"),
    };
    manager.publish(&typing).await.unwrap();
    assert_eq!(server.next_received().await, typing);

    manager.disconnect().await;
    assert!(!manager.is_connected());
    assert!(matches!(
        manager.publish(&typing).await,
        Err(TransportError::NotConnected)
    ));
}
