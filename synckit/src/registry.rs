//! Registry of live connections and the document subscription index.
//!
//! Two views kept mutually consistent under the index lock: `connection
//! id → Connection` and `document id → subscriber ids`. A connection's
//! own subscription set mirrors the index; documents never hold
//! connection references (the cycle is broken here, by id).
//!
//! Local fan-out happens here: [`ConnectionManager::broadcast_to_document`]
//! delivers to every subscriber except the sender, shedding slow
//! consumers (full outbound queue) with 1011.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::connection::{close_code, Connection, SendError};
use crate::protocol::{reason, Message};

/// Registration faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// `max_connections` reached; the upgrade is rejected.
    AtCapacity(usize),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::AtCapacity(n) => write!(f, "connection limit reached: {n}"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Thread-safe connection registry.
pub struct ConnectionManager {
    max_connections: usize,
    connections: RwLock<HashMap<Uuid, Arc<Connection>>>,
    subscribers: RwLock<HashMap<String, HashSet<Uuid>>>,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            connections: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Admit a connection, enforcing the connection cap.
    pub async fn register(&self, connection: Arc<Connection>) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;
        if connections.len() >= self.max_connections {
            return Err(RegistryError::AtCapacity(self.max_connections));
        }
        connections.insert(connection.id, connection);
        Ok(())
    }

    /// Remove a connection and scrub it from every subscriber set.
    pub async fn unregister(&self, connection_id: Uuid) -> Option<Arc<Connection>> {
        let connection = self.connections.write().await.remove(&connection_id)?;
        let documents = connection.subscriptions().await;
        if !documents.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for document_id in &documents {
                if let Some(set) = subscribers.get_mut(document_id) {
                    set.remove(&connection_id);
                    if set.is_empty() {
                        subscribers.remove(document_id);
                    }
                }
            }
        }
        Some(connection)
    }

    pub async fn get(&self, connection_id: Uuid) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&connection_id).cloned()
    }

    /// Add to both views. Returns false when already subscribed.
    pub async fn subscribe(&self, connection: &Arc<Connection>, document_id: &str) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let newly_indexed = subscribers
            .entry(document_id.to_string())
            .or_default()
            .insert(connection.id);
        let newly_local = connection.add_subscription(document_id).await;
        newly_indexed || newly_local
    }

    /// Remove from both views. Returns false when not subscribed.
    pub async fn unsubscribe(&self, connection: &Arc<Connection>, document_id: &str) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let was_indexed = match subscribers.get_mut(document_id) {
            Some(set) => {
                let removed = set.remove(&connection.id);
                if set.is_empty() {
                    subscribers.remove(document_id);
                }
                removed
            }
            None => false,
        };
        let was_local = connection.remove_subscription(document_id).await;
        was_indexed || was_local
    }

    /// Subscriber connections for a document.
    pub async fn subscribers(&self, document_id: &str) -> Vec<Arc<Connection>> {
        let ids: Vec<Uuid> = {
            let subscribers = self.subscribers.read().await;
            match subscribers.get(document_id) {
                Some(set) => set.iter().copied().collect(),
                None => return Vec::new(),
            }
        };
        let connections = self.connections.read().await;
        ids.iter()
            .filter_map(|id| connections.get(id).cloned())
            .collect()
    }

    /// Fan a message out to every local subscriber except `exclude`.
    ///
    /// Slow consumers (full queue) are closed with 1011 and
    /// unregistered. Returns how many connections the frame was
    /// enqueued to.
    pub async fn broadcast_to_document(
        &self,
        document_id: &str,
        message: &Message,
        exclude: Option<Uuid>,
    ) -> usize {
        let targets = self.subscribers(document_id).await;
        let mut delivered = 0;
        let mut shed: Vec<Arc<Connection>> = Vec::new();

        for connection in targets {
            if Some(connection.id) == exclude {
                continue;
            }
            match connection.send(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(SendError::QueueFull) => shed.push(connection),
                Err(SendError::Closed) => {}
            }
        }

        for connection in shed {
            log::warn!(
                "connection {} cannot keep up on {document_id}, shedding",
                connection.id
            );
            connection
                .close(close_code::INTERNAL, reason::SLOW_CONSUMER)
                .await;
            self.unregister(connection.id).await;
        }

        delivered
    }

    /// Ask every connection to close. Used at shutdown.
    pub async fn close_all(&self, code: u16, why: &str) {
        let connections: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();
        for connection in connections {
            connection.close(code, why).await;
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Snapshot of every live connection.
    pub async fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn subscriber_count(&self, document_id: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(document_id)
            .map_or(0, |set| set.len())
    }

    /// Documents with at least one subscriber.
    pub async fn subscribed_document_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Arc<Connection> {
        let (conn, _rx, _close) = Connection::new("127.0.0.1:1", 8);
        // Receiver handles dropped: sends go to a closed channel, which
        // these tests don't exercise unless they keep their own handles.
        conn
    }

    fn connection_with_rx() -> (Arc<Connection>, tokio::sync::mpsc::Receiver<Message>) {
        let (conn, rx, _close) = Connection::new("127.0.0.1:1", 8);
        (conn, rx)
    }

    #[tokio::test]
    async fn test_register_enforces_capacity() {
        let manager = ConnectionManager::new(2);
        manager.register(connection()).await.unwrap();
        manager.register(connection()).await.unwrap();
        let err = manager.register(connection()).await.unwrap_err();
        assert_eq!(err, RegistryError::AtCapacity(2));
        assert_eq!(manager.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_subscribe_keeps_both_views_consistent() {
        let manager = ConnectionManager::new(8);
        let conn = connection();
        manager.register(conn.clone()).await.unwrap();

        assert!(manager.subscribe(&conn, "doc1").await);
        assert!(conn.is_subscribed("doc1").await);
        assert_eq!(manager.subscriber_count("doc1").await, 1);

        // Idempotent.
        assert!(!manager.subscribe(&conn, "doc1").await);
        assert_eq!(manager.subscriber_count("doc1").await, 1);

        assert!(manager.unsubscribe(&conn, "doc1").await);
        assert!(!conn.is_subscribed("doc1").await);
        assert_eq!(manager.subscriber_count("doc1").await, 0);

        // No-op when not subscribed.
        assert!(!manager.unsubscribe(&conn, "doc1").await);
    }

    #[tokio::test]
    async fn test_unregister_scrubs_subscriber_sets() {
        let manager = ConnectionManager::new(8);
        let conn = connection();
        manager.register(conn.clone()).await.unwrap();
        manager.subscribe(&conn, "doc1").await;
        manager.subscribe(&conn, "doc2").await;

        manager.unregister(conn.id).await.unwrap();
        assert_eq!(manager.connection_count().await, 0);
        assert_eq!(manager.subscriber_count("doc1").await, 0);
        assert_eq!(manager.subscriber_count("doc2").await, 0);
        assert_eq!(manager.subscribed_document_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let manager = ConnectionManager::new(8);
        let (sender, mut sender_rx) = connection_with_rx();
        let (receiver, mut receiver_rx) = connection_with_rx();
        manager.register(sender.clone()).await.unwrap();
        manager.register(receiver.clone()).await.unwrap();
        manager.subscribe(&sender, "doc1").await;
        manager.subscribe(&receiver, "doc1").await;

        let delivered = manager
            .broadcast_to_document("doc1", &Message::ack("m1"), Some(sender.id))
            .await;
        assert_eq!(delivered, 1);
        assert!(receiver_rx.try_recv().is_ok());
        assert!(sender_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_sheds_slow_consumer() {
        let manager = ConnectionManager::new(8);
        let (slow, _slow_rx, slow_close) = Connection::new("127.0.0.1:1", 1);
        manager.register(slow.clone()).await.unwrap();
        manager.subscribe(&slow, "doc1").await;

        // Fill the queue, then broadcast into the full queue.
        slow.send(Message::ping()).await.unwrap();
        let delivered = manager
            .broadcast_to_document("doc1", &Message::ack("m1"), None)
            .await;
        assert_eq!(delivered, 0);
        assert_eq!(manager.connection_count().await, 0);
        assert_eq!(
            slow_close.borrow().clone().unwrap().reason,
            reason::SLOW_CONSUMER
        );
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_document() {
        let manager = ConnectionManager::new(8);
        let delivered = manager
            .broadcast_to_document("ghost", &Message::ping(), None)
            .await;
        assert_eq!(delivered, 0);
    }
}
