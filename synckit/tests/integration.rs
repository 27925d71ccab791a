//! End-to-end tests over real WebSocket connections.
//!
//! Each test starts a hub on a free port, connects raw
//! tokio-tungstenite clients, and drives the JSON protocol exactly as
//! a client library would.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use synckit::auth::{HmacIdentityProvider, Permissions, Principal};
use synckit::clock::VectorClock;
use synckit::config::Config;
use synckit::protocol::{reason, Message};
use synckit::pubsub::NoopPubSub;
use synckit::server::SyncServer;
use synckit::storage::MemoryStorage;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const SECRET: &str = "integration-secret-32-characters!!";

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a hub with the given config on a free port.
async fn start_server(mut config: Config) -> (Arc<SyncServer>, u16) {
    let port = free_port().await;
    config.port = port;
    let identity = Arc::new(HmacIdentityProvider::new(
        SECRET.as_bytes().to_vec(),
        None,
        None,
        vec![],
    ));
    let server = Arc::new(SyncServer::new(
        config,
        Arc::new(MemoryStorage::new()),
        identity,
        Arc::new(NoopPubSub::new()),
        Uuid::new_v4(),
    ));
    tokio::spawn(server.clone().run());
    // Give the listener time to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, port)
}

async fn start_default_server() -> (Arc<SyncServer>, u16) {
    start_server(Config::for_testing()).await
}

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .expect("client should connect");
        Self { ws }
    }

    async fn send(&mut self, message: &Message) {
        let text = message.encode().unwrap();
        self.ws.send(WsMessage::Text(text.into())).await.unwrap();
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(WsMessage::Text(text.to_string().into()))
            .await
            .unwrap();
    }

    /// Next protocol message, skipping the greeting and heartbeats.
    async fn recv(&mut self) -> Message {
        loop {
            let frame = timeout(Duration::from_secs(3), self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream ended")
                .expect("socket error");
            match frame {
                WsMessage::Text(text) => {
                    let message = Message::decode(text.as_str()).expect("undecodable frame");
                    match message {
                        Message::Connect { .. } | Message::Ping { .. } => continue,
                        other => return other,
                    }
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                WsMessage::Close(frame) => panic!("unexpected close: {frame:?}"),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    /// Wait for a server-initiated close; returns the close code.
    async fn recv_close(&mut self) -> u16 {
        loop {
            let frame = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for close");
            match frame {
                Some(Ok(WsMessage::Close(Some(frame)))) => return frame.code.into(),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => panic!("stream ended without a close frame"),
            }
        }
    }

    async fn auth_anonymous(&mut self, client_id: &str) {
        self.send(&Message::Auth {
            id: format!("auth-{client_id}"),
            timestamp: 0,
            token: None,
            api_key: None,
            client_id: client_id.to_string(),
        })
        .await;
        match self.recv().await {
            Message::AuthSuccess { .. } => {}
            other => panic!("expected auth_success, got {}", other.type_name()),
        }
    }

    async fn auth_token(&mut self, client_id: &str, token: &str) -> Message {
        self.send(&Message::Auth {
            id: format!("auth-{client_id}"),
            timestamp: 0,
            token: Some(token.to_string()),
            api_key: None,
            client_id: client_id.to_string(),
        })
        .await;
        self.recv().await
    }

    /// Subscribe and return the sync_response; the awareness_state that
    /// follows is consumed too.
    async fn subscribe(&mut self, id: &str, document_id: &str) -> Message {
        self.send(&Message::Subscribe {
            id: id.to_string(),
            timestamp: 0,
            document_id: document_id.to_string(),
        })
        .await;
        let response = self.recv().await;
        match self.recv().await {
            Message::AwarenessState { .. } => {}
            other => panic!("expected awareness_state, got {}", other.type_name()),
        }
        response
    }

    async fn send_delta(&mut self, id: &str, document_id: &str, client: &str, counter: u64) {
        let mut clock = VectorClock::new();
        clock.set(client, counter);
        self.send(&Message::Delta {
            id: id.to_string(),
            timestamp: 0,
            document_id: document_id.to_string(),
            delta: json!({"op": "set", "k": counter}),
            vector_clock: clock,
        })
        .await;
    }
}

#[tokio::test]
async fn test_server_greets_on_upgrade() {
    let (_server, port) = start_default_server().await;
    let mut client = TestClient::connect(port).await;

    let frame = timeout(Duration::from_secs(2), client.ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match frame {
        WsMessage::Text(text) => match Message::decode(text.as_str()).unwrap() {
            Message::Connect { .. } => {}
            other => panic!("expected connect greeting, got {}", other.type_name()),
        },
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn test_auth_then_subscribe_then_delta_fan_out() {
    let (_server, port) = start_default_server().await;
    let mut a = TestClient::connect(port).await;
    let mut b = TestClient::connect(port).await;
    a.auth_anonymous("a").await;
    b.auth_anonymous("b").await;

    a.subscribe("s1", "doc1").await;
    b.subscribe("s2", "doc1").await;

    a.send_delta("d1", "doc1", "a", 1).await;

    // A receives the ack.
    match a.recv().await {
        Message::Ack { message_id, .. } => assert_eq!(message_id, "d1"),
        other => panic!("expected ack, got {}", other.type_name()),
    }

    // B receives the delta with the payload intact.
    match b.recv().await {
        Message::Delta {
            id,
            document_id,
            delta,
            vector_clock,
            ..
        } => {
            assert_eq!(id, "d1");
            assert_eq!(document_id, "doc1");
            assert_eq!(delta, json!({"op": "set", "k": 1}));
            assert_eq!(vector_clock.get("a"), 1);
        }
        other => panic!("expected delta, got {}", other.type_name()),
    }

    // Catching up from {"a": 1} yields nothing.
    let mut seen = VectorClock::new();
    seen.set("a", 1);
    a.send(&Message::SyncRequest {
        id: "r1".into(),
        timestamp: 0,
        document_id: "doc1".into(),
        vector_clock: Some(seen),
    })
    .await;
    match a.recv().await {
        Message::SyncResponse {
            request_id, deltas, ..
        } => {
            assert_eq!(request_id, "r1");
            assert!(deltas.is_empty());
        }
        other => panic!("expected sync_response, got {}", other.type_name()),
    }
}

#[tokio::test]
async fn test_causality_gap_is_rejected() {
    let (server, port) = start_default_server().await;
    let mut a = TestClient::connect(port).await;
    a.auth_anonymous("a").await;
    a.subscribe("s1", "doc1").await;

    // Counter 2 without counter 1.
    a.send_delta("d2", "doc1", "a", 2).await;
    match a.recv().await {
        Message::Error { reason: r, .. } => assert_eq!(r, reason::CAUSALITY_VIOLATION),
        other => panic!("expected error, got {}", other.type_name()),
    }

    // Nothing was stored.
    a.send(&Message::SyncRequest {
        id: "r1".into(),
        timestamp: 0,
        document_id: "doc1".into(),
        vector_clock: None,
    })
    .await;
    match a.recv().await {
        Message::SyncResponse { deltas, .. } => assert!(deltas.is_empty()),
        other => panic!("expected sync_response, got {}", other.type_name()),
    }
    assert_eq!(
        server.storage().get_deltas_since("doc1", None).await.unwrap().len(),
        0
    );
}

#[tokio::test]
async fn test_unauthorized_write_gets_no_ack_and_no_broadcast() {
    let mut config = Config::for_testing();
    config.auth_required = true;
    config.jwt_secret = Some(SECRET.to_string());
    let (_server, port) = start_server(config).await;

    let identity =
        HmacIdentityProvider::new(SECRET.as_bytes().to_vec(), None, None, vec![]);
    let reader = Principal {
        user_id: "reader".into(),
        email: None,
        permissions: Permissions {
            can_read: ["doc1".to_string()].into_iter().collect(),
            can_write: Default::default(),
            is_admin: false,
        },
    };
    let writer = Principal {
        user_id: "writer".into(),
        email: None,
        permissions: Permissions {
            can_read: ["doc1".to_string()].into_iter().collect(),
            can_write: ["doc1".to_string()].into_iter().collect(),
            is_admin: false,
        },
    };
    let reader_token = identity.issue_token(&reader, Duration::from_secs(60)).unwrap();
    let writer_token = identity.issue_token(&writer, Duration::from_secs(60)).unwrap();

    let mut watcher = TestClient::connect(port).await;
    match watcher.auth_token("w", &writer_token).await {
        Message::AuthSuccess { .. } => {}
        other => panic!("expected auth_success, got {}", other.type_name()),
    }
    watcher.subscribe("s0", "doc1").await;

    let mut restricted = TestClient::connect(port).await;
    match restricted.auth_token("r", &reader_token).await {
        Message::AuthSuccess { user_id, permissions, .. } => {
            assert_eq!(user_id, "reader");
            assert_eq!(permissions["canWrite"], json!([]));
        }
        other => panic!("expected auth_success, got {}", other.type_name()),
    }

    // Subscribe succeeds with read access.
    match restricted.subscribe("s1", "doc1").await {
        Message::SyncResponse { .. } => {}
        other => panic!("expected sync_response, got {}", other.type_name()),
    }

    // The write is denied; no ack follows.
    restricted.send_delta("d1", "doc1", "r", 1).await;
    match restricted.recv().await {
        Message::Error { reason: r, .. } => assert_eq!(r, reason::PERMISSION_DENIED),
        other => panic!("expected error, got {}", other.type_name()),
    }

    // Nothing reached the other subscriber: its next frame is the ack
    // for its own later delta, not a broadcast.
    watcher.send_delta("dw", "doc1", "w", 1).await;
    match watcher.recv().await {
        Message::Ack { message_id, .. } => assert_eq!(message_id, "dw"),
        other => panic!("expected ack, got {}", other.type_name()),
    }
}

#[tokio::test]
async fn test_expired_token_closes_connection() {
    let mut config = Config::for_testing();
    config.auth_required = true;
    config.jwt_secret = Some(SECRET.to_string());
    let (_server, port) = start_server(config).await;

    let identity =
        HmacIdentityProvider::new(SECRET.as_bytes().to_vec(), None, None, vec![]);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let claims = synckit::auth::TokenClaims {
        sub: "u1".into(),
        email: None,
        permissions: Permissions::admin(),
        iat: now - 7200,
        exp: now - 3600,
        iss: None,
        aud: None,
    };
    let stale = identity.issue_raw(&claims).unwrap();

    let mut client = TestClient::connect(port).await;
    match client.auth_token("a", &stale).await {
        Message::AuthError { reason: r, .. } => assert_eq!(r, reason::AUTH_FAILED),
        other => panic!("expected auth_error, got {}", other.type_name()),
    }
    let code = client.recv_close().await;
    assert_eq!(code, 1008);
}

#[tokio::test]
async fn test_awareness_stale_clock_dropped() {
    let (_server, port) = start_default_server().await;
    let mut alice = TestClient::connect(port).await;
    let mut bob = TestClient::connect(port).await;
    alice.auth_anonymous("alice").await;
    bob.auth_anonymous("bob").await;
    alice.subscribe("s1", "doc1").await;
    bob.subscribe("s2", "doc1").await;

    let update = |id: &str, state: Value, clock: u64| Message::AwarenessUpdate {
        id: id.into(),
        timestamp: 0,
        document_id: "doc1".into(),
        client_id: "alice".into(),
        state,
        clock,
    };

    alice.send(&update("w1", json!("X"), 5)).await;
    match bob.recv().await {
        Message::AwarenessUpdate { state, clock, .. } => {
            assert_eq!(state, json!("X"));
            assert_eq!(clock, 5);
        }
        other => panic!("expected awareness_update, got {}", other.type_name()),
    }

    // Same clock, new state: silently dropped.
    alice.send(&update("w2", json!("Y"), 5)).await;

    // Greater clock: applied and broadcast. Receiving this proves the
    // stale update produced no frame (ordering per connection).
    alice.send(&update("w3", json!("Y"), 6)).await;
    match bob.recv().await {
        Message::AwarenessUpdate { state, clock, .. } => {
            assert_eq!(state, json!("Y"));
            assert_eq!(clock, 6);
        }
        other => panic!("expected awareness_update, got {}", other.type_name()),
    }
}

#[tokio::test]
async fn test_subscribe_delivers_history_in_order() {
    let (_server, port) = start_default_server().await;
    let mut a = TestClient::connect(port).await;
    let mut b = TestClient::connect(port).await;
    a.auth_anonymous("a").await;
    b.auth_anonymous("b").await;
    a.subscribe("s1", "doc1").await;
    b.subscribe("s2", "doc1").await;

    a.send_delta("d1", "doc1", "a", 1).await;
    let _ = a.recv().await; // ack
    a.send_delta("d2", "doc1", "a", 2).await;
    let _ = a.recv().await; // ack
    b.send_delta("d3", "doc1", "b", 1).await;

    // Drain B's copies of A's deltas and its own ack.
    let mut b_acked = false;
    let mut b_seen = 0;
    while !(b_acked && b_seen == 2) {
        match b.recv().await {
            Message::Ack { .. } => b_acked = true,
            Message::Delta { .. } => b_seen += 1,
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    let mut c = TestClient::connect(port).await;
    c.auth_anonymous("c").await;
    match c.subscribe("s3", "doc1").await {
        Message::SyncResponse { state, deltas, .. } => {
            assert_eq!(state, json!({"a": 2, "b": 1}));
            assert_eq!(deltas.len(), 3);
            assert_eq!(deltas[0].vector_clock.get("a"), 1);
            assert_eq!(deltas[1].vector_clock.get("a"), 2);
            assert_eq!(deltas[2].vector_clock.get("b"), 1);
        }
        other => panic!("expected sync_response, got {}", other.type_name()),
    }
}

#[tokio::test]
async fn test_heartbeat_timeout_closes_and_unsubscribes() {
    let mut config = Config::for_testing();
    config.ws_heartbeat_interval = Duration::from_millis(100);
    config.ws_heartbeat_timeout = Duration::from_millis(300);
    let (server, port) = start_server(config).await;

    let mut client = TestClient::connect(port).await;
    client.auth_anonymous("quiet").await;
    client.subscribe("s1", "doc1").await;
    assert_eq!(server.registry().subscriber_count("doc1").await, 1);

    // Send nothing; ignore pings. The server must close with 1001
    // within heartbeat_timeout + one interval.
    let code = client.recv_close().await;
    assert_eq!(code, 1001);

    // Both indexes forget the connection.
    timeout(Duration::from_secs(2), async {
        while server.registry().connection_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connection should be unregistered");
    assert_eq!(server.registry().subscriber_count("doc1").await, 0);
}

#[tokio::test]
async fn test_invalid_frame_keeps_connection_open() {
    let (_server, port) = start_default_server().await;
    let mut client = TestClient::connect(port).await;

    client.send_raw("{not valid json").await;
    match client.recv().await {
        Message::Error { reason: r, .. } => assert_eq!(r, reason::INVALID_FRAME),
        other => panic!("expected error, got {}", other.type_name()),
    }

    client.send_raw(r#"{"type": "warp_drive", "id": "x"}"#).await;
    match client.recv().await {
        Message::Error { reason: r, .. } => assert_eq!(r, reason::UNKNOWN_MESSAGE_TYPE),
        other => panic!("expected error, got {}", other.type_name()),
    }

    // Still usable.
    client.auth_anonymous("still-here").await;
}

#[tokio::test]
async fn test_oversize_frame_closes_with_policy_violation() {
    let mut config = Config::for_testing();
    config.ws_max_frame_bytes = 512;
    let (_server, port) = start_server(config).await;

    let mut client = TestClient::connect(port).await;
    client.auth_anonymous("big").await;

    let huge = format!(
        r#"{{"type":"subscribe","id":"s1","timestamp":0,"documentId":"{}"}}"#,
        "x".repeat(1024)
    );
    client.send_raw(&huge).await;
    match client.recv().await {
        Message::Error { reason: r, .. } => assert_eq!(r, reason::FRAME_TOO_LARGE),
        other => panic!("expected error, got {}", other.type_name()),
    }
    assert_eq!(client.recv_close().await, 1008);
}

#[tokio::test]
async fn test_auth_timeout_closes_with_1008() {
    let mut config = Config::for_testing();
    config.auth_timeout = Duration::from_millis(300);
    let (_server, port) = start_server(config).await;

    let mut client = TestClient::connect(port).await;
    // Never authenticate.
    let code = client.recv_close().await;
    assert_eq!(code, 1008);
}

#[tokio::test]
async fn test_messages_before_auth_are_rejected() {
    let (_server, port) = start_default_server().await;
    let mut client = TestClient::connect(port).await;
    client
        .send(&Message::Subscribe {
            id: "s1".into(),
            timestamp: 0,
            document_id: "doc1".into(),
        })
        .await;
    match client.recv().await {
        Message::Error { reason: r, .. } => assert_eq!(r, reason::NOT_AUTHENTICATED),
        other => panic!("expected error, got {}", other.type_name()),
    }
    // The connection survived; authenticate normally.
    client.auth_anonymous("late").await;
}

#[tokio::test]
async fn test_protocol_ping_pong() {
    let (_server, port) = start_default_server().await;
    let mut client = TestClient::connect(port).await;
    client
        .send(&Message::Ping {
            id: "ping-1".into(),
            timestamp: 0,
        })
        .await;
    match client.recv().await {
        Message::Pong { message_id, .. } => assert_eq!(message_id, "ping-1"),
        other => panic!("expected pong, got {}", other.type_name()),
    }
}

#[tokio::test]
async fn test_shutdown_drains_connections() {
    let (server, port) = start_default_server().await;
    let mut client = TestClient::connect(port).await;
    client.auth_anonymous("a").await;

    let server_for_shutdown = server.clone();
    let shutdown = tokio::spawn(async move { server_for_shutdown.shutdown().await });

    let code = client.recv_close().await;
    assert_eq!(code, 1001);

    let clean = shutdown.await.unwrap();
    assert!(clean, "drain should complete before the deadline");
    assert_eq!(server.registry().connection_count().await, 0);
}
