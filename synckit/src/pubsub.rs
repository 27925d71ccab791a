//! Cross-node fan-out of deltas and awareness updates.
//!
//! One channel per document (`{prefix}doc:{id}`) carrying tagged JSON
//! envelopes. The hub is pub/sub-unaware: the coordinator publishes
//! through [`PubSubBus`] and the server feeds received envelopes back
//! into local fan-out. Delivery is at-least-once; duplicates are
//! harmless because delta append is idempotent by id. Each envelope
//! carries the originating node id so a node can discard its own
//! publications.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Delta,
    Awareness,
}

/// A message crossing nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEnvelope {
    /// Node that published this envelope.
    pub node_id: Uuid,
    pub document_id: String,
    pub kind: EnvelopeKind,
    /// Origin client for deltas; the wire delta does not carry it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_client_id: Option<String>,
    /// The wire message, verbatim.
    pub message: Value,
}

/// Bus faults.
#[derive(Debug, Clone)]
pub enum PubSubError {
    /// Single-node deployment; no broker configured.
    NotConnected,
    Connection(String),
    Publish(String),
    Decode(String),
}

impl std::fmt::Display for PubSubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PubSubError::NotConnected => write!(f, "pub/sub not connected"),
            PubSubError::Connection(e) => write!(f, "pub/sub connection error: {e}"),
            PubSubError::Publish(e) => write!(f, "pub/sub publish error: {e}"),
            PubSubError::Decode(e) => write!(f, "pub/sub decode error: {e}"),
        }
    }
}

impl std::error::Error for PubSubError {}

/// Cross-node transport seam.
#[async_trait]
pub trait PubSubBus: Send + Sync {
    /// Publish an envelope to this document's channel. Failures are
    /// logged by the caller and never fail the local operation.
    async fn publish(&self, envelope: &RemoteEnvelope) -> Result<(), PubSubError>;

    /// Stream of envelopes published by other nodes.
    async fn subscribe(&self) -> Result<mpsc::Receiver<RemoteEnvelope>, PubSubError>;

    async fn health_check(&self) -> Result<(), PubSubError>;
}

/// In-process stand-in for single-node deployments: publishes vanish,
/// the subscription never yields, and the health check reports not
/// connected.
pub struct NoopPubSub {
    // Held so subscriber channels stay open instead of ending at once.
    keepalive: tokio::sync::Mutex<Vec<mpsc::Sender<RemoteEnvelope>>>,
}

impl NoopPubSub {
    pub fn new() -> Self {
        Self {
            keepalive: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

impl Default for NoopPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubBus for NoopPubSub {
    async fn publish(&self, _envelope: &RemoteEnvelope) -> Result<(), PubSubError> {
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<RemoteEnvelope>, PubSubError> {
        let (tx, rx) = mpsc::channel(1);
        self.keepalive.lock().await.push(tx);
        Ok(rx)
    }

    async fn health_check(&self) -> Result<(), PubSubError> {
        Err(PubSubError::NotConnected)
    }
}

/// Redis-backed bus.
///
/// PUBLISH goes through a connection manager (auto-reconnect); the
/// subscription side runs PSUBSCRIBE `{prefix}doc:*` on a dedicated
/// connection and re-establishes it with backoff when it drops.
pub struct RedisPubSub {
    client: redis::Client,
    manager: redis::aio::ConnectionManager,
    channel_prefix: String,
    node_id: Uuid,
}

impl RedisPubSub {
    pub async fn connect(
        connection_string: &str,
        channel_prefix: impl Into<String>,
        node_id: Uuid,
    ) -> Result<Self, PubSubError> {
        let client = redis::Client::open(connection_string)
            .map_err(|e| PubSubError::Connection(e.to_string()))?;
        let manager = redis::aio::ConnectionManager::new(client.clone())
            .await
            .map_err(|e| PubSubError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            manager,
            channel_prefix: channel_prefix.into(),
            node_id,
        })
    }

    fn channel_for(&self, document_id: &str) -> String {
        format!("{}doc:{}", self.channel_prefix, document_id)
    }

    fn pattern(&self) -> String {
        format!("{}doc:*", self.channel_prefix)
    }
}

#[async_trait]
impl PubSubBus for RedisPubSub {
    async fn publish(&self, envelope: &RemoteEnvelope) -> Result<(), PubSubError> {
        let payload = serde_json::to_string(envelope)
            .map_err(|e| PubSubError::Publish(e.to_string()))?;
        let channel = self.channel_for(&envelope.document_id);
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| PubSubError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<RemoteEnvelope>, PubSubError> {
        let (tx, rx) = mpsc::channel(1024);
        let client = self.client.clone();
        let pattern = self.pattern();
        let node_id = self.node_id;

        tokio::spawn(async move {
            loop {
                let pubsub = match client.get_async_connection().await {
                    Ok(conn) => conn.into_pubsub(),
                    Err(e) => {
                        log::warn!("pub/sub connect failed, retrying: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };
                let mut pubsub = pubsub;
                if let Err(e) = pubsub.psubscribe(&pattern).await {
                    log::warn!("psubscribe {pattern} failed, retrying: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
                log::info!("pub/sub subscribed to {pattern}");

                let mut stream = pubsub.into_on_message();
                while let Some(msg) = stream.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            log::warn!("pub/sub payload read failed: {e}");
                            continue;
                        }
                    };
                    let envelope: RemoteEnvelope = match serde_json::from_str(&payload) {
                        Ok(e) => e,
                        Err(e) => {
                            log::warn!("pub/sub envelope decode failed: {e}");
                            continue;
                        }
                    };
                    // Our own publication — local fan-out already ran.
                    if envelope.node_id == node_id {
                        continue;
                    }
                    if tx.send(envelope).await.is_err() {
                        return; // Receiver dropped; server is gone.
                    }
                }
                log::warn!("pub/sub stream ended, reconnecting");
            }
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<(), PubSubError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| PubSubError::Connection(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_noop_publish_succeeds() {
        let bus = NoopPubSub::new();
        let envelope = RemoteEnvelope {
            node_id: Uuid::new_v4(),
            document_id: "doc1".into(),
            kind: EnvelopeKind::Delta,
            origin_client_id: Some("alice".into()),
            message: json!({"type": "delta"}),
        };
        assert!(bus.publish(&envelope).await.is_ok());
    }

    #[tokio::test]
    async fn test_noop_subscription_stays_silent() {
        let bus = NoopPubSub::new();
        let mut rx = bus.subscribe().await.unwrap();
        let timeout =
            tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(timeout.is_err(), "noop bus should never yield");
    }

    #[tokio::test]
    async fn test_noop_health_reports_not_connected() {
        let bus = NoopPubSub::new();
        assert!(matches!(
            bus.health_check().await,
            Err(PubSubError::NotConnected)
        ));
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = RemoteEnvelope {
            node_id: Uuid::new_v4(),
            document_id: "doc1".into(),
            kind: EnvelopeKind::Awareness,
            origin_client_id: None,
            message: json!({"type": "awareness_update", "clock": 3}),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: RemoteEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_envelope_kind_is_snake_case() {
        let json = serde_json::to_string(&EnvelopeKind::Awareness).unwrap();
        assert_eq!(json, r#""awareness""#);
    }
}
