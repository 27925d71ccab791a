//! The sync state machine.
//!
//! Every authenticated inbound frame lands here. The coordinator
//! authorizes it, validates causality, persists through the storage
//! adapter, publishes to the pub/sub bus, and fans out to local
//! subscribers via the connection manager.
//!
//! Write path for a delta:
//! ```text
//! Connection ──► authorize ──► causal check ──► AppendDelta
//!                                                   │
//!                              ┌────────────────────┤
//!                              ▼                    ▼
//!                        Pub/Sub publish      local fan-out
//!                        (fire-and-forget)    (minus sender)
//!                                                   │
//!                                                   ▼
//!                                             Ack to sender
//! ```
//!
//! Document-scoped steps run under a per-document async mutex so local
//! broadcast order always matches append order. No lock spans two
//! documents. Handler failures become `error` replies plus a log line;
//! they never tear down the reader.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::auth::{Credential, IdentityProvider, Principal};
use crate::awareness::AwarenessStore;
use crate::clock::VectorClock;
use crate::config::Config;
use crate::connection::{close_code, ConnState, Connection};
use crate::protocol::{now_millis, reason, DeltaEnvelope, Message};
use crate::pubsub::{EnvelopeKind, PubSubBus, RemoteEnvelope};
use crate::registry::ConnectionManager;
use crate::storage::{SessionRecord, StorageAdapter, StorageError, StoredDelta};

/// Dispatches authenticated messages and owns the per-document write
/// critical sections.
pub struct SyncCoordinator {
    storage: Arc<dyn StorageAdapter>,
    identity: Arc<dyn IdentityProvider>,
    awareness: Arc<AwarenessStore>,
    pubsub: Arc<dyn PubSubBus>,
    registry: Arc<ConnectionManager>,
    config: Arc<Config>,
    /// This node's identity on the pub/sub bus.
    node_id: Uuid,
    doc_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncCoordinator {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        identity: Arc<dyn IdentityProvider>,
        awareness: Arc<AwarenessStore>,
        pubsub: Arc<dyn PubSubBus>,
        registry: Arc<ConnectionManager>,
        config: Arc<Config>,
        node_id: Uuid,
    ) -> Self {
        Self {
            storage,
            identity,
            awareness,
            pubsub,
            registry,
            config,
            node_id,
            doc_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// The append-then-broadcast mutex for one document.
    async fn doc_lock(&self, document_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.doc_locks.lock().await;
        locks
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ─── Dispatch ────────────────────────────────────────────────────

    /// Handle one inbound frame. Ping/pong never reach here; the
    /// connection layer answers them.
    pub async fn handle_message(&self, connection: &Arc<Connection>, message: Message) {
        match connection.state().await {
            ConnState::Closing | ConnState::Closed => {}
            ConnState::Open | ConnState::Authenticating => {
                match message {
                    Message::Auth {
                        id,
                        token,
                        api_key,
                        client_id,
                        ..
                    } => {
                        self.handle_auth(connection, &id, token, api_key, client_id)
                            .await
                    }
                    Message::Disconnect { .. } => {
                        connection
                            .close(close_code::NORMAL, "client_disconnect")
                            .await
                    }
                    other => {
                        log::debug!(
                            "connection {} sent {} before authenticating",
                            connection.id,
                            other.type_name()
                        );
                        let _ = connection
                            .send_error(reason::NOT_AUTHENTICATED, None)
                            .await;
                    }
                }
            }
            ConnState::Authenticated => self.dispatch_authenticated(connection, message).await,
        }
    }

    async fn dispatch_authenticated(&self, connection: &Arc<Connection>, message: Message) {
        match message {
            Message::Auth { .. } => {
                // One successful auth per connection.
                let _ = connection.send(Message::auth_error(reason::AUTH_FAILED)).await;
            }
            Message::Subscribe {
                id, document_id, ..
            } => self.handle_subscribe(connection, &id, &document_id).await,
            Message::Unsubscribe {
                id, document_id, ..
            } => self.handle_unsubscribe(connection, &id, &document_id).await,
            Message::SyncRequest {
                id,
                document_id,
                vector_clock,
                ..
            } => {
                self.handle_sync_request(connection, &id, &document_id, vector_clock)
                    .await
            }
            Message::Delta { .. } => self.handle_delta(connection, message).await,
            Message::AwarenessSubscribe {
                id, document_id, ..
            } => {
                self.handle_awareness_subscribe(connection, &id, &document_id)
                    .await
            }
            Message::AwarenessUpdate { .. } => {
                self.handle_awareness_update(connection, message).await
            }
            Message::Disconnect { .. } => {
                connection
                    .close(close_code::NORMAL, "client_disconnect")
                    .await
            }
            Message::Connect { .. } => {
                log::debug!("connection {} sent connect; ignoring", connection.id);
            }
            // Server-origin frames have no inbound meaning; drop them
            // rather than punishing a confused client.
            other => {
                log::debug!(
                    "connection {} sent server-origin frame {}",
                    connection.id,
                    other.type_name()
                );
            }
        }
    }

    // ─── Auth ────────────────────────────────────────────────────────

    async fn handle_auth(
        &self,
        connection: &Arc<Connection>,
        _message_id: &str,
        token: Option<String>,
        api_key: Option<String>,
        client_id: String,
    ) {
        connection.set_state(ConnState::Authenticating).await;

        let principal = if self.config.auth_required {
            let credential = match Credential::from_fields(token, api_key) {
                Ok(credential) => credential,
                Err(e) => {
                    log::warn!("connection {} auth rejected: {e}", connection.id);
                    return self.reject_auth(connection).await;
                }
            };
            match self.identity.authenticate(&credential).await {
                Ok(principal) => principal,
                Err(e) => {
                    // Full detail stays in the log; the wire gets the
                    // generic reason.
                    log::warn!("connection {} auth failed: {e}", connection.id);
                    return self.reject_auth(connection).await;
                }
            }
        } else {
            Principal::anonymous_admin()
        };

        let session_id = Uuid::new_v4().to_string();
        let now = now_millis();
        let session = SessionRecord {
            id: session_id.clone(),
            user_id: principal.user_id.clone(),
            client_id: client_id.clone(),
            connected_at: now,
            last_seen: now,
            metadata: json!({ "remoteAddr": connection.remote_addr }),
        };
        if let Err(e) = self.storage.save_session(session).await {
            log::error!("session persist failed for {}: {e}", connection.id);
        }

        let user_id = principal.user_id.clone();
        let permissions = principal.permissions_value();
        connection
            .bind_identity(principal, client_id, session_id)
            .await;
        let _ = connection
            .send(Message::auth_success(user_id, permissions))
            .await;
        log::info!("connection {} authenticated", connection.id);
    }

    async fn reject_auth(&self, connection: &Arc<Connection>) {
        let _ = connection.send(Message::auth_error(reason::AUTH_FAILED)).await;
        connection.close(close_code::POLICY, reason::AUTH_FAILED).await;
    }

    // ─── Subscribe / Unsubscribe ─────────────────────────────────────

    async fn handle_subscribe(
        &self,
        connection: &Arc<Connection>,
        message_id: &str,
        document_id: &str,
    ) {
        let Some(principal) = connection.principal().await else {
            let _ = connection.send_error(reason::NOT_AUTHENTICATED, None).await;
            return;
        };
        if !principal.can_read(document_id) {
            let _ = connection
                .send_error(reason::PERMISSION_DENIED, Some(doc_details(document_id)))
                .await;
            return;
        }

        let lock = self.doc_lock(document_id).await;
        let _guard = lock.lock().await;

        if let Err(e) = self.storage.get_or_create_document(document_id).await {
            self.report_storage_error(connection, document_id, &e).await;
            return;
        }
        self.registry.subscribe(connection, document_id).await;

        let (clock, deltas) = match self.snapshot(document_id, None).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.report_storage_error(connection, document_id, &e).await;
                return;
            }
        };
        let _ = connection
            .send(Message::sync_response(message_id, document_id, &clock, deltas))
            .await;

        // Current presence rides along with the subscription.
        let states = self.awareness.snapshot(document_id).await;
        let _ = connection
            .send(Message::awareness_state(document_id, states))
            .await;

        log::debug!("connection {} subscribed to {document_id}", connection.id);
    }

    async fn handle_unsubscribe(
        &self,
        connection: &Arc<Connection>,
        message_id: &str,
        document_id: &str,
    ) {
        self.registry.unsubscribe(connection, document_id).await;
        let _ = connection.send(Message::ack(message_id)).await;

        if let Some(client_id) = connection.client_id().await {
            self.broadcast_leave(document_id, &client_id, Some(connection.id))
                .await;
        }
    }

    // ─── Sync ────────────────────────────────────────────────────────

    async fn handle_sync_request(
        &self,
        connection: &Arc<Connection>,
        message_id: &str,
        document_id: &str,
        client_clock: Option<VectorClock>,
    ) {
        let Some(principal) = connection.principal().await else {
            let _ = connection.send_error(reason::NOT_AUTHENTICATED, None).await;
            return;
        };
        if !principal.can_read(document_id) {
            let _ = connection
                .send_error(reason::PERMISSION_DENIED, Some(doc_details(document_id)))
                .await;
            return;
        }

        // An unknown document is reported empty, never created.
        match self.storage.get_document(document_id).await {
            Ok(None) => {
                let _ = connection
                    .send(Message::sync_response(
                        message_id,
                        document_id,
                        &VectorClock::new(),
                        Vec::new(),
                    ))
                    .await;
            }
            Ok(Some(_)) => {
                match self.snapshot(document_id, client_clock.as_ref()).await {
                    Ok((clock, deltas)) => {
                        let _ = connection
                            .send(Message::sync_response(
                                message_id,
                                document_id,
                                &clock,
                                deltas,
                            ))
                            .await;
                    }
                    Err(e) => self.report_storage_error(connection, document_id, &e).await,
                }
            }
            Err(e) => self.report_storage_error(connection, document_id, &e).await,
        }
    }

    /// Document clock plus pending deltas for a client clock.
    async fn snapshot(
        &self,
        document_id: &str,
        since: Option<&VectorClock>,
    ) -> Result<(VectorClock, Vec<DeltaEnvelope>), StorageError> {
        let clock = self.storage.get_document_clock(document_id).await?;
        let deltas = self.storage.get_deltas_since(document_id, since).await?;
        let envelopes = deltas
            .into_iter()
            .map(|d| DeltaEnvelope {
                delta: d.payload,
                vector_clock: d.vector_clock,
            })
            .collect();
        Ok((clock, envelopes))
    }

    // ─── Delta ───────────────────────────────────────────────────────

    async fn handle_delta(&self, connection: &Arc<Connection>, message: Message) {
        let Message::Delta {
            ref id,
            ref document_id,
            ref delta,
            ref vector_clock,
            ..
        } = message
        else {
            return;
        };

        let (Some(principal), Some(client_id)) =
            (connection.principal().await, connection.client_id().await)
        else {
            let _ = connection.send_error(reason::NOT_AUTHENTICATED, None).await;
            return;
        };
        if !principal.can_write(document_id) {
            let _ = connection
                .send_error(reason::PERMISSION_DENIED, Some(doc_details(document_id)))
                .await;
            return;
        }
        if !connection.is_subscribed(document_id).await {
            let _ = connection
                .send_error(reason::NOT_SUBSCRIBED, Some(doc_details(document_id)))
                .await;
            return;
        }

        let lock = self.doc_lock(document_id).await;
        let _guard = lock.lock().await;

        // Same-origin causal delivery: the sender's own component must
        // advance by exactly one. No gap, no reorder.
        let document_clock = match self.storage.get_document_clock(document_id).await {
            Ok(clock) => clock,
            Err(e) => {
                self.report_storage_error(connection, document_id, &e).await;
                return;
            }
        };
        let latest_seen = document_clock.get(&client_id);
        let incoming = vector_clock.get(&client_id);
        if incoming != latest_seen + 1 {
            log::debug!(
                "causality violation on {document_id} from {client_id}: have {latest_seen}, got {incoming}"
            );
            let _ = connection
                .send_error(
                    reason::CAUSALITY_VIOLATION,
                    Some(json!({
                        "documentId": document_id,
                        "expected": latest_seen + 1,
                        "received": incoming,
                    })),
                )
                .await;
            return;
        }

        let stored = StoredDelta {
            id: id.clone(),
            document_id: document_id.clone(),
            origin_client_id: client_id.clone(),
            vector_clock: vector_clock.clone(),
            payload: delta.clone(),
            timestamp: now_millis(),
        };
        let appended = match self.storage.append_delta(document_id, stored).await {
            Ok(appended) => appended,
            Err(e) => {
                // Not stored: nothing is broadcast.
                self.report_storage_error(connection, document_id, &e).await;
                return;
            }
        };

        if appended {
            self.publish(document_id, EnvelopeKind::Delta, Some(&client_id), &message)
                .await;
            self.registry
                .broadcast_to_document(document_id, &message, Some(connection.id))
                .await;
        }

        let _ = connection.send(Message::ack(id.clone())).await;
    }

    // ─── Awareness ───────────────────────────────────────────────────

    async fn handle_awareness_subscribe(
        &self,
        connection: &Arc<Connection>,
        _message_id: &str,
        document_id: &str,
    ) {
        let Some(principal) = connection.principal().await else {
            let _ = connection.send_error(reason::NOT_AUTHENTICATED, None).await;
            return;
        };
        if !principal.can_read(document_id) {
            let _ = connection
                .send_error(reason::PERMISSION_DENIED, Some(doc_details(document_id)))
                .await;
            return;
        }
        let states = self.awareness.snapshot(document_id).await;
        let _ = connection
            .send(Message::awareness_state(document_id, states))
            .await;
    }

    async fn handle_awareness_update(&self, connection: &Arc<Connection>, message: Message) {
        let Message::AwarenessUpdate {
            ref document_id,
            ref client_id,
            ref state,
            clock,
            ..
        } = message
        else {
            return;
        };

        let (Some(principal), Some(bound_client_id)) =
            (connection.principal().await, connection.client_id().await)
        else {
            let _ = connection.send_error(reason::NOT_AUTHENTICATED, None).await;
            return;
        };
        if !principal.can_read(document_id) {
            let _ = connection
                .send_error(reason::PERMISSION_DENIED, Some(doc_details(document_id)))
                .await;
            return;
        }
        if !connection.is_subscribed(document_id).await {
            let _ = connection
                .send_error(reason::NOT_SUBSCRIBED, Some(doc_details(document_id)))
                .await;
            return;
        }
        // Presence is first-person only.
        if *client_id != bound_client_id {
            let _ = connection
                .send_error(
                    reason::PERMISSION_DENIED,
                    Some(json!({"clientId": client_id})),
                )
                .await;
            return;
        }

        let presence = if state.is_null() {
            None
        } else {
            Some(state.clone())
        };
        let applied = self
            .awareness
            .put(document_id, client_id, presence, clock, now_millis())
            .await;

        // Stale clocks are dropped silently; no ack either way.
        if applied {
            self.publish(document_id, EnvelopeKind::Awareness, None, &message)
                .await;
            self.registry
                .broadcast_to_document(document_id, &message, Some(connection.id))
                .await;
        }
    }

    /// Retire a client's presence on a document and tell everyone.
    async fn broadcast_leave(
        &self,
        document_id: &str,
        client_id: &str,
        exclude: Option<Uuid>,
    ) {
        let Some(clock) = self
            .awareness
            .force_leave(document_id, client_id, now_millis())
            .await
        else {
            return;
        };
        let leave = Message::AwarenessUpdate {
            id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            document_id: document_id.to_string(),
            client_id: client_id.to_string(),
            state: Value::Null,
            clock,
        };
        self.publish(document_id, EnvelopeKind::Awareness, None, &leave)
            .await;
        self.registry
            .broadcast_to_document(document_id, &leave, exclude)
            .await;
    }

    // ─── Disconnect & remote envelopes ───────────────────────────────

    /// Connection teardown: presence leaves for every subscription,
    /// session refresh, registry scrub.
    pub async fn handle_disconnect(&self, connection: &Arc<Connection>) {
        let subscriptions = connection.subscriptions().await;
        if let Some(client_id) = connection.client_id().await {
            for document_id in &subscriptions {
                self.broadcast_leave(document_id, &client_id, Some(connection.id))
                    .await;
            }
        }
        if let Some(session_id) = connection.session_id().await {
            if let Err(e) = self
                .storage
                .update_session_last_seen(&session_id, now_millis())
                .await
            {
                log::debug!("session refresh on disconnect failed: {e}");
            }
        }
        self.registry.unregister(connection.id).await;
        connection.set_state(ConnState::Closed).await;
    }

    /// Apply an envelope published by another node: store (idempotent)
    /// and fan out locally. Duplicates vanish at the append.
    pub async fn apply_remote(&self, envelope: RemoteEnvelope) {
        let message: Message = match serde_json::from_value(envelope.message.clone()) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("undecodable remote envelope for {}: {e}", envelope.document_id);
                return;
            }
        };
        match (envelope.kind, &message) {
            (
                EnvelopeKind::Delta,
                Message::Delta {
                    id,
                    document_id,
                    delta,
                    vector_clock,
                    ..
                },
            ) => {
                let lock = self.doc_lock(document_id).await;
                let _guard = lock.lock().await;
                let origin = envelope
                    .origin_client_id
                    .clone()
                    .unwrap_or_else(|| origin_of(vector_clock));
                let stored = StoredDelta {
                    id: id.clone(),
                    document_id: document_id.clone(),
                    origin_client_id: origin,
                    vector_clock: vector_clock.clone(),
                    payload: delta.clone(),
                    timestamp: now_millis(),
                };
                match self.storage.append_delta(document_id, stored).await {
                    Ok(true) => {
                        self.registry
                            .broadcast_to_document(document_id, &message, None)
                            .await;
                    }
                    Ok(false) => {} // Duplicate delivery.
                    Err(e) => {
                        log::error!("remote delta append failed on {document_id}: {e}");
                    }
                }
            }
            (
                EnvelopeKind::Awareness,
                Message::AwarenessUpdate {
                    document_id,
                    client_id,
                    state,
                    clock,
                    ..
                },
            ) => {
                let presence = if state.is_null() {
                    None
                } else {
                    Some(state.clone())
                };
                let applied = self
                    .awareness
                    .put(document_id, client_id, presence, *clock, now_millis())
                    .await;
                if applied {
                    self.registry
                        .broadcast_to_document(document_id, &message, None)
                        .await;
                }
            }
            (kind, other) => {
                log::warn!(
                    "remote envelope kind {kind:?} carried unexpected {}",
                    other.type_name()
                );
            }
        }
    }

    // ─── Helpers ─────────────────────────────────────────────────────

    async fn publish(
        &self,
        document_id: &str,
        kind: EnvelopeKind,
        origin_client_id: Option<&str>,
        message: &Message,
    ) {
        let envelope = RemoteEnvelope {
            node_id: self.node_id,
            document_id: document_id.to_string(),
            kind,
            origin_client_id: origin_client_id.map(str::to_string),
            message: match serde_json::to_value(message) {
                Ok(value) => value,
                Err(e) => {
                    log::error!("envelope encode failed for {document_id}: {e}");
                    return;
                }
            },
        };
        // Fire-and-forget: a broken bus never blocks local fan-out.
        if let Err(e) = self.pubsub.publish(&envelope).await {
            log::warn!("pub/sub publish failed for {document_id}: {e}");
        }
    }

    async fn report_storage_error(
        &self,
        connection: &Arc<Connection>,
        document_id: &str,
        error: &StorageError,
    ) {
        log::error!("storage failure on {document_id}: {error}");
        let _ = connection
            .send_error(reason::INTERNAL_ERROR, Some(doc_details(document_id)))
            .await;
    }
}

fn doc_details(document_id: &str) -> Value {
    json!({ "documentId": document_id })
}

/// Best-effort origin for a remotely published delta: its own component
/// is the one that advanced, so any single-entry clock names it.
fn origin_of(clock: &VectorClock) -> String {
    clock
        .iter()
        .max_by_key(|(_, counter)| *counter)
        .map(|(client, _)| client.to_string())
        .unwrap_or_default()
}
