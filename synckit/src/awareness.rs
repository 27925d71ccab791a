//! Ephemeral per-document presence ("awareness") store.
//!
//! Each document keeps a map of `client_id → (state, clock,
//! last_updated)`. Clocks are per-(client, document) monotonic: an
//! update whose clock is not strictly greater than the stored one is
//! dropped, including re-joins after a `state = null` leave marker.
//! Entries are TTL-evicted; nothing here is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::protocol::AwarenessPeer;

/// One client's presence on one document.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: String,
    /// `None` means the client has left.
    pub state: Option<Value>,
    pub clock: u64,
    /// Unix milliseconds of the last accepted update.
    pub last_updated: i64,
}

type DocumentEntries = Arc<RwLock<HashMap<String, AwarenessEntry>>>;

/// Presence map for all documents, locked per document.
#[derive(Default)]
pub struct AwarenessStore {
    documents: RwLock<HashMap<String, DocumentEntries>>,
}

impl AwarenessStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entries(&self, document_id: &str) -> DocumentEntries {
        {
            let documents = self.documents.read().await;
            if let Some(entries) = documents.get(document_id) {
                return entries.clone();
            }
        }
        let mut documents = self.documents.write().await;
        documents
            .entry(document_id.to_string())
            .or_default()
            .clone()
    }

    /// Apply an update if its clock is strictly greater than the stored
    /// one. Returns whether the update was accepted.
    pub async fn put(
        &self,
        document_id: &str,
        client_id: &str,
        state: Option<Value>,
        clock: u64,
        now: i64,
    ) -> bool {
        let entries = self.entries(document_id).await;
        let mut entries = entries.write().await;
        if let Some(existing) = entries.get(client_id) {
            if clock <= existing.clock {
                return false;
            }
        }
        entries.insert(
            client_id.to_string(),
            AwarenessEntry {
                client_id: client_id.to_string(),
                state,
                clock,
                last_updated: now,
            },
        );
        true
    }

    /// A leave is a put with `state = null`.
    pub async fn leave(
        &self,
        document_id: &str,
        client_id: &str,
        clock: u64,
        now: i64,
    ) -> bool {
        self.put(document_id, client_id, None, clock, now).await
    }

    /// Server-initiated leave (disconnect, unsubscribe): supersedes the
    /// stored entry with `stored.clock + 1`. Returns the clock used, or
    /// `None` when the client had no entry to retire.
    pub async fn force_leave(
        &self,
        document_id: &str,
        client_id: &str,
        now: i64,
    ) -> Option<u64> {
        let entries = self.entries(document_id).await;
        let mut entries = entries.write().await;
        let existing = entries.get(client_id)?;
        if existing.state.is_none() {
            return None;
        }
        let clock = existing.clock + 1;
        entries.insert(
            client_id.to_string(),
            AwarenessEntry {
                client_id: client_id.to_string(),
                state: None,
                clock,
                last_updated: now,
            },
        );
        Some(clock)
    }

    /// Snapshot of all present (non-null) entries for a document.
    pub async fn snapshot(&self, document_id: &str) -> Vec<AwarenessPeer> {
        let documents = self.documents.read().await;
        let Some(entries) = documents.get(document_id) else {
            return Vec::new();
        };
        let entries = entries.read().await;
        let mut peers: Vec<AwarenessPeer> = entries
            .values()
            .filter_map(|e| {
                e.state.as_ref().map(|state| AwarenessPeer {
                    client_id: e.client_id.clone(),
                    state: state.clone(),
                    clock: e.clock,
                })
            })
            .collect();
        peers.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        peers
    }

    /// The stored clock for `(document, client)`, if any.
    pub async fn clock_of(&self, document_id: &str, client_id: &str) -> Option<u64> {
        let documents = self.documents.read().await;
        let entries = documents.get(document_id)?;
        let entries = entries.read().await;
        entries.get(client_id).map(|e| e.clock)
    }

    /// Evict entries idle longer than `ttl`. Returns how many were
    /// removed.
    pub async fn remove_stale(&self, document_id: &str, now: i64, ttl: Duration) -> usize {
        let documents = self.documents.read().await;
        let Some(entries) = documents.get(document_id) else {
            return 0;
        };
        let mut entries = entries.write().await;
        let before = entries.len();
        let ttl_ms = ttl.as_millis() as i64;
        entries.retain(|_, e| now - e.last_updated <= ttl_ms);
        before - entries.len()
    }

    /// Run eviction over every document and drop empty maps.
    pub async fn sweep(&self, now: i64, ttl: Duration) -> usize {
        let document_ids: Vec<String> = {
            let documents = self.documents.read().await;
            documents.keys().cloned().collect()
        };
        let mut removed = 0;
        for document_id in &document_ids {
            removed += self.remove_stale(document_id, now, ttl).await;
        }
        let mut documents = self.documents.write().await;
        let mut empty_ids = Vec::new();
        for (id, entries) in documents.iter() {
            if entries.read().await.is_empty() {
                empty_ids.push(id.clone());
            }
        }
        for id in empty_ids {
            documents.remove(&id);
        }
        removed
    }

    pub async fn document_count(&self) -> usize {
        self.documents.read().await.len()
    }
}
