//! WebSocket accept loop and server lifecycle.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── reader task ── Coordinator
//!             ├── TcpListener ── conn ─┤
//! Client B ──┘      (accept)           └── writer task ── outbound queue
//!                                                │
//!                               Pub/Sub receive task ── apply_remote
//!                               Awareness sweeper    ── TTL eviction
//!                               Session keeper       ── refresh + GC
//! ```
//!
//! Shutdown: stop accepting, close every connection with 1001
//! `server_shutdown`, wait up to the drain deadline, then force the
//! rest. The readiness probe reports not-ready for the whole drain.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::auth::IdentityProvider;
use crate::awareness::AwarenessStore;
use crate::config::Config;
use crate::connection::{
    close_code, run_writer, ConnState, Connection, WriterExit,
};
use crate::coordinator::SyncCoordinator;
use crate::protocol::{reason, Message};
use crate::pubsub::PubSubBus;
use crate::registry::ConnectionManager;
use crate::storage::StorageAdapter;

/// Lock-free counters for the hot path; read via [`SyncServer::stats`].
#[derive(Default)]
pub struct SharedStats {
    pub total_connections: AtomicU64,
    pub total_messages: AtomicU64,
    pub total_bytes: AtomicU64,
}

/// Point-in-time server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub documents: u64,
}

/// The sync hub server.
pub struct SyncServer {
    config: Arc<Config>,
    registry: Arc<ConnectionManager>,
    coordinator: Arc<SyncCoordinator>,
    storage: Arc<dyn StorageAdapter>,
    awareness: Arc<AwarenessStore>,
    pubsub: Arc<dyn PubSubBus>,
    stats: Arc<SharedStats>,
    started_at: Instant,
    ready: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncServer {
    /// Wire the hub together from its collaborators. Provider selection
    /// (memory vs. relational, noop vs. redis) happens in the binary.
    /// `node_id` must match the identity the pub/sub bus filters on.
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageAdapter>,
        identity: Arc<dyn IdentityProvider>,
        pubsub: Arc<dyn PubSubBus>,
        node_id: Uuid,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ConnectionManager::new(config.ws_max_connections));
        let awareness = Arc::new(AwarenessStore::new());
        let coordinator = Arc::new(SyncCoordinator::new(
            storage.clone(),
            identity,
            awareness.clone(),
            pubsub.clone(),
            registry.clone(),
            config.clone(),
            node_id,
        ));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            registry,
            coordinator,
            storage,
            awareness,
            pubsub,
            stats: Arc::new(SharedStats::default()),
            started_at: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
            draining: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionManager> {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    pub fn pubsub(&self) -> &Arc<dyn PubSubBus> {
        &self.pubsub
    }

    pub fn shared_stats(&self) -> &Arc<SharedStats> {
        &self.stats
    }

    pub fn ready_flag(&self) -> &Arc<AtomicBool> {
        &self.ready
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.registry.connection_count().await as u64,
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            documents: self.storage.count_documents().await.unwrap_or(0),
        }
    }

    /// Accept connections until shutdown. Call from an async runtime.
    pub async fn run(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        log::info!("sync hub listening on {}", self.config.bind_addr());

        self.spawn_background_tasks();
        self.ready.store(true, Ordering::SeqCst);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    log::info!("accept loop stopping");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    if self.draining.load(Ordering::SeqCst) {
                        continue;
                    }
                    if self.registry.connection_count().await >= self.config.ws_max_connections {
                        log::warn!("rejecting upgrade from {addr}: at capacity");
                        continue;
                    }
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr.to_string()).await {
                            log::debug!("connection from {addr} ended: {e}");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        // Remote envelopes → local fan-out.
        {
            let server = self.clone();
            tokio::spawn(async move {
                let mut rx = match server.pubsub.subscribe().await {
                    Ok(rx) => rx,
                    Err(e) => {
                        log::warn!("pub/sub subscription unavailable: {e}");
                        return;
                    }
                };
                while let Some(envelope) = rx.recv().await {
                    server.coordinator.apply_remote(envelope).await;
                }
            });
        }

        // Awareness TTL sweeper.
        {
            let server = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(server.config.awareness.sweep_interval);
                let mut shutdown_rx = server.shutdown_tx.subscribe();
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tick.tick() => {
                            let evicted = server
                                .awareness
                                .sweep(crate::protocol::now_millis(), server.config.awareness.ttl)
                                .await;
                            if evicted > 0 {
                                log::debug!("awareness sweep evicted {evicted} entries");
                            }
                        }
                    }
                }
            });
        }

        // Session keeper: refresh live sessions, GC idle ones.
        {
            let server = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(server.config.session_refresh_interval);
                let mut shutdown_rx = server.shutdown_tx.subscribe();
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tick.tick() => {
                            let now = crate::protocol::now_millis();
                            for connection in server.registry.all_connections().await {
                                if let Some(session_id) = connection.session_id().await {
                                    if let Err(e) = server
                                        .storage
                                        .update_session_last_seen(&session_id, now)
                                        .await
                                    {
                                        log::debug!("session refresh failed: {e}");
                                    }
                                }
                            }
                            let cutoff = now - server.config.session_max_idle.as_millis() as i64;
                            match server.storage.delete_sessions_older_than(cutoff).await {
                                Ok(0) => {}
                                Ok(n) => log::info!("session GC removed {n} sessions"),
                                Err(e) => log::warn!("session GC failed: {e}"),
                            }
                        }
                    }
                }
            });
        }
    }

    /// Drive one WebSocket connection: upgrade, greet, read until the
    /// peer goes away or the hub sheds it.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote_addr: String,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (ws_sink, mut ws_receiver) = ws_stream.split();

        let (connection, outbound_rx, close_rx) =
            Connection::new(remote_addr.clone(), self.config.outbound_queue_size);
        if let Err(e) = self.registry.register(connection.clone()).await {
            log::warn!("registration refused for {remote_addr}: {e}");
            return Ok(());
        }
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("connection {} open from {remote_addr}", connection.id);

        let writer = tokio::spawn(run_writer(
            ws_sink,
            outbound_rx,
            close_rx,
            self.config.send_timeout,
        ));

        let _ = connection.send(Message::connect()).await;

        let auth_deadline =
            tokio::time::Instant::now() + self.config.auth_timeout;
        let mut heartbeat = tokio::time::interval(self.config.ws_heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // First tick is immediate; skip it.
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let authenticated = connection.is_authenticated().await;
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    connection
                        .close(close_code::GOING_AWAY, reason::SERVER_SHUTDOWN)
                        .await;
                    break;
                }

                _ = tokio::time::sleep_until(auth_deadline), if !authenticated => {
                    log::info!("connection {} auth timeout", connection.id);
                    let _ = connection.send_error(reason::AUTH_TIMEOUT, None).await;
                    connection.close(close_code::POLICY, reason::AUTH_TIMEOUT).await;
                    break;
                }

                _ = heartbeat.tick() => {
                    if connection.idle_for().await > self.config.ws_heartbeat_timeout {
                        log::info!("connection {} heartbeat timeout", connection.id);
                        connection
                            .close(close_code::GOING_AWAY, "heartbeat_timeout")
                            .await;
                        break;
                    }
                    let _ = connection.send(Message::ping()).await;
                }

                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            connection.touch().await;
                            self.stats
                                .total_bytes
                                .fetch_add(text.len() as u64, Ordering::Relaxed);
                            if text.len() > self.config.ws_max_frame_bytes {
                                let _ = connection
                                    .send_error(reason::FRAME_TOO_LARGE, None)
                                    .await;
                                connection
                                    .close(close_code::POLICY, reason::FRAME_TOO_LARGE)
                                    .await;
                                break;
                            }
                            self.handle_frame(&connection, text.as_str()).await;
                        }
                        Some(Ok(WsMessage::Binary(_))) => {
                            connection.touch().await;
                            let _ = connection
                                .send_error(reason::INVALID_FRAME, None)
                                .await;
                        }
                        Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                            // Transport-level keepalive; tungstenite
                            // answers pings on its own.
                            connection.touch().await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::debug!("connection {} closed by peer", connection.id);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::debug!("connection {} socket error: {e}", connection.id);
                            break;
                        }
                    }
                }
            }
        }

        // Stop the writer if nothing else has.
        connection.close(close_code::NORMAL, "closed").await;
        match writer.await {
            Ok(WriterExit::SendTimeout) => {
                log::warn!("connection {} shed on send timeout", connection.id);
            }
            Ok(_) => {}
            Err(e) => log::debug!("writer task for {} aborted: {e}", connection.id),
        }

        self.coordinator.handle_disconnect(&connection).await;
        log::info!("connection {} closed", connection.id);
        Ok(())
    }

    /// Decode one text frame and route it.
    async fn handle_frame(&self, connection: &Arc<Connection>, text: &str) {
        let message = match Message::decode(text) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("connection {} bad frame: {e}", connection.id);
                let _ = connection.send_error(e.wire_reason(), None).await;
                return;
            }
        };
        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);

        // Heartbeats are connection-level; everything else goes to the
        // coordinator.
        match message {
            Message::Ping { id, .. } => {
                let _ = connection.send(Message::pong(id)).await;
            }
            Message::Pong { .. } => {}
            other => self.coordinator.handle_message(connection, other).await,
        }
    }

    /// Orderly shutdown: stop accepting, drain, then force. Returns
    /// true when every connection closed within the deadline.
    pub async fn shutdown(&self) -> bool {
        log::info!("shutdown: draining connections");
        self.ready.store(false, Ordering::SeqCst);
        self.draining.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        self.registry
            .close_all(close_code::GOING_AWAY, reason::SERVER_SHUTDOWN)
            .await;

        let deadline = Instant::now() + self.config.drain_deadline;
        while self.registry.connection_count().await > 0 && Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let remaining = self.registry.connection_count().await;
        if remaining > 0 {
            log::warn!("drain deadline passed with {remaining} connections; forcing close");
            for connection in self.registry.all_connections().await {
                self.registry.unregister(connection.id).await;
                connection.set_state(ConnState::Closed).await;
            }
            false
        } else {
            log::info!("drained cleanly");
            true
        }
    }
}
