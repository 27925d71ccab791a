//! In-memory storage adapter.
//!
//! A concurrent map keyed by document id; every document carries its
//! own write mutex so appends on different documents never contend.
//! The single-node default, and the fixture every adapter contract
//! test runs against.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::clock::VectorClock;
use crate::protocol::now_millis;

use super::{
    CleanupOptions, CleanupReport, DocumentRecord, SessionRecord, StorageAdapter,
    StorageError, StoredDelta,
};

struct DocumentEntry {
    record: DocumentRecord,
    deltas: Vec<StoredDelta>,
    delta_ids: HashSet<String>,
}

impl DocumentEntry {
    fn new(document_id: &str, now: i64) -> Self {
        Self {
            record: DocumentRecord {
                id: document_id.to_string(),
                created_at: now,
                updated_at: now,
                vector_clock: VectorClock::new(),
            },
            deltas: Vec::new(),
            delta_ids: HashSet::new(),
        }
    }
}

/// Process-local storage.
#[derive(Default)]
pub struct MemoryStorage {
    documents: RwLock<HashMap<String, Arc<Mutex<DocumentEntry>>>>,
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, document_id: &str) -> Option<Arc<Mutex<DocumentEntry>>> {
        self.documents.read().await.get(document_id).cloned()
    }

    async fn entry_or_create(&self, document_id: &str) -> Arc<Mutex<DocumentEntry>> {
        {
            let documents = self.documents.read().await;
            if let Some(entry) = documents.get(document_id) {
                return entry.clone();
            }
        }
        let mut documents = self.documents.write().await;
        documents
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DocumentEntry::new(document_id, now_millis()))))
            .clone()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get_or_create_document(
        &self,
        document_id: &str,
    ) -> Result<DocumentRecord, StorageError> {
        let entry = self.entry_or_create(document_id).await;
        let entry = entry.lock().await;
        Ok(entry.record.clone())
    }

    async fn get_document(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>, StorageError> {
        match self.entry(document_id).await {
            Some(entry) => Ok(Some(entry.lock().await.record.clone())),
            None => Ok(None),
        }
    }

    async fn append_delta(
        &self,
        document_id: &str,
        delta: StoredDelta,
    ) -> Result<bool, StorageError> {
        let entry = self.entry_or_create(document_id).await;
        let mut entry = entry.lock().await;
        if entry.delta_ids.contains(&delta.id) {
            return Ok(false);
        }
        entry.delta_ids.insert(delta.id.clone());
        entry.record.vector_clock.merge(&delta.vector_clock);
        entry.record.updated_at = now_millis();
        entry.deltas.push(delta);
        Ok(true)
    }

    async fn get_deltas_since(
        &self,
        document_id: &str,
        since: Option<&VectorClock>,
    ) -> Result<Vec<StoredDelta>, StorageError> {
        let Some(entry) = self.entry(document_id).await else {
            return Ok(Vec::new());
        };
        let entry = entry.lock().await;
        let deltas = match since {
            None => entry.deltas.clone(),
            Some(clock) => entry
                .deltas
                .iter()
                .filter(|d| !d.vector_clock.observed_by(clock))
                .cloned()
                .collect(),
        };
        Ok(deltas)
    }

    async fn get_document_clock(
        &self,
        document_id: &str,
    ) -> Result<VectorClock, StorageError> {
        match self.entry(document_id).await {
            Some(entry) => Ok(entry.lock().await.record.vector_clock.clone()),
            None => Ok(VectorClock::new()),
        }
    }

    async fn count_documents(&self) -> Result<u64, StorageError> {
        Ok(self.documents.read().await.len() as u64)
    }

    async fn save_session(&self, session: SessionRecord) -> Result<(), StorageError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn update_session_last_seen(
        &self,
        session_id: &str,
        last_seen: i64,
    ) -> Result<(), StorageError> {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.last_seen = last_seen;
        }
        Ok(())
    }

    async fn get_sessions_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<SessionRecord>, StorageError> {
        let sessions = self.sessions.read().await;
        let mut found: Vec<SessionRecord> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        Ok(found)
    }

    async fn delete_sessions_older_than(&self, cutoff: i64) -> Result<u64, StorageError> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.last_seen >= cutoff);
        Ok((before - sessions.len()) as u64)
    }

    async fn cleanup(&self, options: CleanupOptions) -> Result<CleanupReport, StorageError> {
        let mut report = CleanupReport::default();
        if let Some(cutoff) = options.deltas_before {
            let documents = self.documents.read().await;
            for entry in documents.values() {
                let mut entry = entry.lock().await;
                let before = entry.deltas.len();
                let keep: Vec<StoredDelta> = entry
                    .deltas
                    .iter()
                    .filter(|d| d.timestamp >= cutoff)
                    .cloned()
                    .collect();
                let removed_ids: Vec<String> = entry
                    .deltas
                    .iter()
                    .filter(|d| d.timestamp < cutoff)
                    .map(|d| d.id.clone())
                    .collect();
                for id in removed_ids {
                    entry.delta_ids.remove(&id);
                }
                entry.deltas = keep;
                report.deltas_removed += (before - entry.deltas.len()) as u64;
            }
        }
        if let Some(cutoff) = options.sessions_before {
            report.sessions_removed = self.delete_sessions_older_than(cutoff).await?;
        }
        Ok(report)
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(id: &str, client: &str, counter: u64) -> StoredDelta {
        let mut clock = VectorClock::new();
        clock.set(client, counter);
        StoredDelta {
            id: id.to_string(),
            document_id: "doc1".to_string(),
            origin_client_id: client.to_string(),
            vector_clock: clock,
            payload: json!({"op": "set", "n": counter}),
            timestamp: now_millis(),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_lazy_and_stable() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get_document("doc1").await.unwrap(), None);

        let created = storage.get_or_create_document("doc1").await.unwrap();
        assert!(created.vector_clock.is_empty());

        let again = storage.get_or_create_document("doc1").await.unwrap();
        assert_eq!(created.created_at, again.created_at);
        assert_eq!(storage.count_documents().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_append_merges_document_clock() {
        let storage = MemoryStorage::new();
        assert!(storage.append_delta("doc1", delta("d1", "a", 1)).await.unwrap());
        assert!(storage.append_delta("doc1", delta("d2", "a", 2)).await.unwrap());
        assert!(storage.append_delta("doc1", delta("d3", "b", 1)).await.unwrap());

        let clock = storage.get_document_clock("doc1").await.unwrap();
        assert_eq!(clock.get("a"), 2);
        assert_eq!(clock.get("b"), 1);
    }

    #[tokio::test]
    async fn test_append_idempotent_by_id() {
        let storage = MemoryStorage::new();
        assert!(storage.append_delta("doc1", delta("d1", "a", 1)).await.unwrap());
        assert!(!storage.append_delta("doc1", delta("d1", "a", 1)).await.unwrap());

        let deltas = storage.get_deltas_since("doc1", None).await.unwrap();
        assert_eq!(deltas.len(), 1);
        let clock = storage.get_document_clock("doc1").await.unwrap();
        assert_eq!(clock.get("a"), 1);
    }

    #[tokio::test]
    async fn test_deltas_since_filters_observed() {
        let storage = MemoryStorage::new();
        storage.append_delta("doc1", delta("d1", "a", 1)).await.unwrap();
        storage.append_delta("doc1", delta("d2", "a", 2)).await.unwrap();
        storage.append_delta("doc1", delta("d3", "b", 1)).await.unwrap();

        // Client has observed a:1 only.
        let mut seen = VectorClock::new();
        seen.set("a", 1);
        let pending = storage.get_deltas_since("doc1", Some(&seen)).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d2", "d3"]);
    }

    #[tokio::test]
    async fn test_deltas_since_document_clock_is_empty() {
        let storage = MemoryStorage::new();
        storage.append_delta("doc1", delta("d1", "a", 1)).await.unwrap();
        storage.append_delta("doc1", delta("d2", "b", 1)).await.unwrap();

        let clock = storage.get_document_clock("doc1").await.unwrap();
        let pending = storage.get_deltas_since("doc1", Some(&clock)).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_deltas_in_append_order() {
        let storage = MemoryStorage::new();
        storage.append_delta("doc1", delta("d1", "a", 1)).await.unwrap();
        storage.append_delta("doc1", delta("d2", "b", 1)).await.unwrap();
        storage.append_delta("doc1", delta("d3", "a", 2)).await.unwrap();

        let all = storage.get_deltas_since("doc1", None).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2", "d3"]);
    }

    #[tokio::test]
    async fn test_unknown_document_reads() {
        let storage = MemoryStorage::new();
        assert!(storage.get_deltas_since("nope", None).await.unwrap().is_empty());
        assert!(storage.get_document_clock("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sessions_roundtrip() {
        let storage = MemoryStorage::new();
        let session = SessionRecord {
            id: "s1".into(),
            user_id: "u1".into(),
            client_id: "alice".into(),
            connected_at: 1_000,
            last_seen: 1_000,
            metadata: json!({"agent": "test"}),
        };
        storage.save_session(session.clone()).await.unwrap();
        storage.update_session_last_seen("s1", 5_000).await.unwrap();

        let sessions = storage.get_sessions_by_user("u1").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].last_seen, 5_000);

        let removed = storage.delete_sessions_older_than(6_000).await.unwrap();
        assert_eq!(removed, 1);
        assert!(storage.get_sessions_by_user("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_counts() {
        let storage = MemoryStorage::new();
        let mut old = delta("d1", "a", 1);
        old.timestamp = 1_000;
        let mut recent = delta("d2", "a", 2);
        recent.timestamp = 9_000;
        storage.append_delta("doc1", old).await.unwrap();
        storage.append_delta("doc1", recent).await.unwrap();
        storage
            .save_session(SessionRecord {
                id: "s1".into(),
                user_id: "u1".into(),
                client_id: "alice".into(),
                connected_at: 500,
                last_seen: 500,
                metadata: json!({}),
            })
            .await
            .unwrap();

        let report = storage
            .cleanup(CleanupOptions {
                deltas_before: Some(5_000),
                sessions_before: Some(5_000),
            })
            .await
            .unwrap();
        assert_eq!(report.deltas_removed, 1);
        assert_eq!(report.sessions_removed, 1);
        assert_eq!(storage.get_deltas_since("doc1", None).await.unwrap().len(), 1);
    }
}
