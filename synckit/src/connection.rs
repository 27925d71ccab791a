//! Per-socket connection state.
//!
//! Each WebSocket is driven by two tasks: a reader (owned by the
//! server's connection loop) and a writer that drains a bounded
//! outbound queue into the socket. All frames to one socket pass
//! through that queue, so they never interleave. A full queue marks a
//! slow consumer; a send that exceeds `send_timeout` closes the socket
//! with 1011.
//!
//! Lifecycle: `Open → Authenticating → Authenticated → Closing →
//! Closed`. Identity and the client-chosen clock id are bound once, at
//! authentication.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::Principal;
use crate::protocol::Message;

/// WebSocket close codes the hub uses.
pub mod close_code {
    /// Going away: heartbeat timeout, server shutdown.
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation: auth timeout, oversize frame.
    pub const POLICY: u16 = 1008;
    /// Internal/unrecoverable: send timeout, slow consumer.
    pub const INTERNAL: u16 = 1011;
    pub const NORMAL: u16 = 1000;
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    Authenticating,
    Authenticated,
    Closing,
    Closed,
}

/// A close instruction for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseCommand {
    pub code: u16,
    pub reason: String,
}

/// Why the writer task exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// Close command processed or queue ended.
    Closed,
    /// A frame write exceeded `send_timeout`.
    SendTimeout,
    /// The transport failed underneath us.
    TransportError,
}

/// Failure to enqueue an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Outbound queue full: the peer is a slow consumer.
    QueueFull,
    /// Connection is closing or the writer is gone.
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::QueueFull => write!(f, "outbound queue full"),
            SendError::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// One live WebSocket connection.
pub struct Connection {
    pub id: Uuid,
    pub remote_addr: String,
    state: RwLock<ConnState>,
    principal: RwLock<Option<Principal>>,
    client_id: RwLock<Option<String>>,
    session_id: RwLock<Option<String>>,
    subscriptions: RwLock<HashSet<String>>,
    last_activity: RwLock<Instant>,
    connected_at: Instant,
    outbound: mpsc::Sender<Message>,
    close_tx: watch::Sender<Option<CloseCommand>>,
}

impl Connection {
    /// Create connection state plus the queue/close handles the writer
    /// task consumes.
    pub fn new(
        remote_addr: impl Into<String>,
        queue_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Message>, watch::Receiver<Option<CloseCommand>>) {
        let (outbound, outbound_rx) = mpsc::channel(queue_size);
        let (close_tx, close_rx) = watch::channel(None);
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            remote_addr: remote_addr.into(),
            state: RwLock::new(ConnState::Open),
            principal: RwLock::new(None),
            client_id: RwLock::new(None),
            session_id: RwLock::new(None),
            subscriptions: RwLock::new(HashSet::new()),
            last_activity: RwLock::new(Instant::now()),
            connected_at: Instant::now(),
            outbound,
            close_tx,
        });
        (connection, outbound_rx, close_rx)
    }

    pub async fn state(&self) -> ConnState {
        *self.state.read().await
    }

    pub async fn set_state(&self, state: ConnState) {
        *self.state.write().await = state;
    }

    pub async fn is_authenticated(&self) -> bool {
        *self.state.read().await == ConnState::Authenticated
    }

    /// Bind identity after a successful auth. One-shot per connection.
    pub async fn bind_identity(
        &self,
        principal: Principal,
        client_id: String,
        session_id: String,
    ) {
        *self.principal.write().await = Some(principal);
        *self.client_id.write().await = Some(client_id);
        *self.session_id.write().await = Some(session_id);
        *self.state.write().await = ConnState::Authenticated;
    }

    pub async fn principal(&self) -> Option<Principal> {
        self.principal.read().await.clone()
    }

    pub async fn client_id(&self) -> Option<String> {
        self.client_id.read().await.clone()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    /// Refresh the activity deadline (any inbound frame).
    pub async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_activity.read().await.elapsed()
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    // ─── Subscriptions (connection-side view) ────────────────────────

    pub async fn add_subscription(&self, document_id: &str) -> bool {
        self.subscriptions
            .write()
            .await
            .insert(document_id.to_string())
    }

    pub async fn remove_subscription(&self, document_id: &str) -> bool {
        self.subscriptions.write().await.remove(document_id)
    }

    pub async fn is_subscribed(&self, document_id: &str) -> bool {
        self.subscriptions.read().await.contains(document_id)
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().await.iter().cloned().collect()
    }

    // ─── Outbound ────────────────────────────────────────────────────

    /// Enqueue a frame. Never blocks: a full queue is reported as
    /// [`SendError::QueueFull`] and the caller sheds the consumer.
    pub async fn send(&self, message: Message) -> Result<(), SendError> {
        match self.state().await {
            ConnState::Closing | ConnState::Closed => return Err(SendError::Closed),
            _ => {}
        }
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Enqueue an `error` reply.
    pub async fn send_error(
        &self,
        reason: &str,
        details: Option<Value>,
    ) -> Result<(), SendError> {
        self.send(Message::error(reason, details)).await
    }

    /// Ask the writer to emit a close frame and stop. Idempotent; the
    /// first close wins.
    pub async fn close(&self, code: u16, reason: &str) {
        {
            let mut state = self.state.write().await;
            if matches!(*state, ConnState::Closing | ConnState::Closed) {
                return;
            }
            *state = ConnState::Closing;
        }
        let _ = self.close_tx.send(Some(CloseCommand {
            code,
            reason: reason.to_string(),
        }));
    }
}

/// Drain the outbound queue into the socket.
///
/// Linearizes frames, applies `send_timeout` per write, and terminates
/// on the first close command. The caller unregisters the connection
/// when this returns.
pub async fn run_writer(
    mut sink: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    mut outbound_rx: mpsc::Receiver<Message>,
    mut close_rx: watch::Receiver<Option<CloseCommand>>,
    send_timeout: Duration,
) -> WriterExit {
    loop {
        tokio::select! {
            biased;

            changed = close_rx.changed() => {
                if changed.is_err() {
                    return WriterExit::Closed;
                }
                let command = close_rx.borrow().clone();
                if let Some(command) = command {
                    // Flush frames enqueued before the close (an error
                    // reply usually precedes it) so the peer sees why.
                    while let Ok(message) = outbound_rx.try_recv() {
                        let Ok(text) = message.encode() else { continue };
                        if tokio::time::timeout(
                            send_timeout,
                            sink.send(WsMessage::Text(text.into())),
                        )
                        .await
                        .map_or(true, |r| r.is_err())
                        {
                            break;
                        }
                    }
                    let frame = CloseFrame {
                        code: CloseCode::from(command.code),
                        reason: command.reason.into(),
                    };
                    let _ = tokio::time::timeout(
                        send_timeout,
                        sink.send(WsMessage::Close(Some(frame))),
                    )
                    .await;
                    return WriterExit::Closed;
                }
            }

            message = outbound_rx.recv() => {
                let Some(message) = message else {
                    return WriterExit::Closed;
                };
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("outbound encode failed: {e}");
                        continue;
                    }
                };
                match tokio::time::timeout(send_timeout, sink.send(WsMessage::Text(text.into())))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        log::debug!("socket write failed: {e}");
                        return WriterExit::TransportError;
                    }
                    Err(_) => {
                        log::warn!("send timed out after {send_timeout:?}, shedding connection");
                        return WriterExit::SendTimeout;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_starts_open_and_unauthenticated() {
        let (conn, _rx, _close) = Connection::new("127.0.0.1:1", 8);
        assert_eq!(conn.state().await, ConnState::Open);
        assert!(!conn.is_authenticated().await);
        assert!(conn.principal().await.is_none());
        assert!(conn.client_id().await.is_none());
    }

    #[tokio::test]
    async fn test_bind_identity_transitions_to_authenticated() {
        let (conn, _rx, _close) = Connection::new("127.0.0.1:1", 8);
        conn.bind_identity(Principal::anonymous_admin(), "alice".into(), "s1".into())
            .await;
        assert!(conn.is_authenticated().await);
        assert_eq!(conn.client_id().await.as_deref(), Some("alice"));
        assert_eq!(conn.session_id().await.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_send_enqueues_in_order() {
        let (conn, mut rx, _close) = Connection::new("127.0.0.1:1", 8);
        conn.send(Message::ack("m1")).await.unwrap();
        conn.send(Message::ack("m2")).await.unwrap();

        match rx.recv().await.unwrap() {
            Message::Ack { message_id, .. } => assert_eq!(message_id, "m1"),
            other => panic!("unexpected {}", other.type_name()),
        }
        match rx.recv().await.unwrap() {
            Message::Ack { message_id, .. } => assert_eq!(message_id, "m2"),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_full_queue_is_slow_consumer() {
        let (conn, _rx, _close) = Connection::new("127.0.0.1:1", 2);
        conn.send(Message::ping()).await.unwrap();
        conn.send(Message::ping()).await.unwrap();
        assert_eq!(conn.send(Message::ping()).await, Err(SendError::QueueFull));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_refuses_sends() {
        let (conn, _rx, close_rx) = Connection::new("127.0.0.1:1", 8);
        conn.close(close_code::GOING_AWAY, "server_shutdown").await;
        assert_eq!(conn.state().await, ConnState::Closing);
        assert_eq!(
            close_rx.borrow().clone(),
            Some(CloseCommand {
                code: close_code::GOING_AWAY,
                reason: "server_shutdown".into()
            })
        );

        // Second close does not overwrite the first.
        conn.close(close_code::INTERNAL, "slow_consumer").await;
        assert_eq!(
            close_rx.borrow().clone().unwrap().reason,
            "server_shutdown"
        );

        assert_eq!(conn.send(Message::ping()).await, Err(SendError::Closed));
    }

    #[tokio::test]
    async fn test_subscription_set() {
        let (conn, _rx, _close) = Connection::new("127.0.0.1:1", 8);
        assert!(conn.add_subscription("doc1").await);
        assert!(!conn.add_subscription("doc1").await);
        assert!(conn.is_subscribed("doc1").await);
        assert!(!conn.is_subscribed("doc2").await);
        assert!(conn.remove_subscription("doc1").await);
        assert!(!conn.remove_subscription("doc1").await);
    }

    #[tokio::test]
    async fn test_touch_refreshes_idle() {
        let (conn, _rx, _close) = Connection::new("127.0.0.1:1", 8);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.idle_for().await >= Duration::from_millis(20));
        conn.touch().await;
        assert!(conn.idle_for().await < Duration::from_millis(20));
    }
}
