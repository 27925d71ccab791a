//! Adapter contract tests.
//!
//! Every storage backend must satisfy the same observable contract;
//! the suite is written against the trait and currently runs on the
//! in-memory adapter. (The relational adapter runs the same calls
//! against Postgres; pointing this suite at a live database is a
//! deployment concern, not a unit one.)

use std::sync::Arc;

use serde_json::json;
use synckit::clock::VectorClock;
use synckit::protocol::now_millis;
use synckit::storage::{
    CleanupOptions, MemoryStorage, SessionRecord, StorageAdapter, StoredDelta,
};

fn delta(id: &str, doc: &str, client: &str, counter: u64) -> StoredDelta {
    let mut clock = VectorClock::new();
    clock.set(client, counter);
    StoredDelta {
        id: id.to_string(),
        document_id: doc.to_string(),
        origin_client_id: client.to_string(),
        vector_clock: clock,
        payload: json!({"client": client, "n": counter}),
        timestamp: now_millis(),
    }
}

async fn contract_lazy_document(storage: &dyn StorageAdapter) {
    assert!(storage.get_document("c-doc").await.unwrap().is_none());
    let created = storage.get_or_create_document("c-doc").await.unwrap();
    assert!(created.vector_clock.is_empty());
    assert!(storage.get_document("c-doc").await.unwrap().is_some());
}

async fn contract_document_clock_is_merge_of_delta_clocks(storage: &dyn StorageAdapter) {
    for (id, client, counter) in
        [("m1", "a", 1), ("m2", "a", 2), ("m3", "b", 1), ("m4", "a", 3)]
    {
        storage
            .append_delta("merge-doc", delta(id, "merge-doc", client, counter))
            .await
            .unwrap();
    }
    let clock = storage.get_document_clock("merge-doc").await.unwrap();
    let mut expected = VectorClock::new();
    for d in storage.get_deltas_since("merge-doc", None).await.unwrap() {
        expected.merge(&d.vector_clock);
    }
    assert_eq!(clock, expected);
}

async fn contract_deltas_since_own_clock_is_empty(storage: &dyn StorageAdapter) {
    for (id, counter) in [("e1", 1), ("e2", 2)] {
        storage
            .append_delta("empty-doc", delta(id, "empty-doc", "a", counter))
            .await
            .unwrap();
    }
    let clock = storage.get_document_clock("empty-doc").await.unwrap();
    let pending = storage
        .get_deltas_since("empty-doc", Some(&clock))
        .await
        .unwrap();
    assert!(pending.is_empty());
}

async fn contract_idempotent_append(storage: &dyn StorageAdapter) {
    assert!(storage
        .append_delta("idem-doc", delta("i1", "idem-doc", "a", 1))
        .await
        .unwrap());
    for _ in 0..3 {
        assert!(!storage
            .append_delta("idem-doc", delta("i1", "idem-doc", "a", 1))
            .await
            .unwrap());
    }
    assert_eq!(
        storage.get_deltas_since("idem-doc", None).await.unwrap().len(),
        1
    );
    assert_eq!(
        storage.get_document_clock("idem-doc").await.unwrap().get("a"),
        1
    );
}

async fn contract_no_per_client_gaps(storage: &dyn StorageAdapter) {
    // Sequential counters per client, interleaved across clients.
    for (id, client, counter) in [
        ("g1", "a", 1),
        ("g2", "b", 1),
        ("g3", "a", 2),
        ("g4", "b", 2),
        ("g5", "a", 3),
    ] {
        storage
            .append_delta("gap-doc", delta(id, "gap-doc", client, counter))
            .await
            .unwrap();
    }
    let deltas = storage.get_deltas_since("gap-doc", None).await.unwrap();
    for client in ["a", "b"] {
        let mut counters: Vec<u64> = deltas
            .iter()
            .filter(|d| d.origin_client_id == client)
            .map(|d| d.vector_clock.get(client))
            .collect();
        counters.sort_unstable();
        let expected: Vec<u64> = (1..=counters.len() as u64).collect();
        assert_eq!(counters, expected, "client {client} has a gap");
    }
}

async fn contract_sessions(storage: &dyn StorageAdapter) {
    let session = SessionRecord {
        id: "sess-1".into(),
        user_id: "user-1".into(),
        client_id: "alice".into(),
        connected_at: 100,
        last_seen: 100,
        metadata: json!({"agent": "contract"}),
    };
    storage.save_session(session).await.unwrap();
    storage.update_session_last_seen("sess-1", 900).await.unwrap();

    let sessions = storage.get_sessions_by_user("user-1").await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].last_seen, 900);
    assert_eq!(sessions[0].metadata, json!({"agent": "contract"}));

    assert_eq!(storage.delete_sessions_older_than(500).await.unwrap(), 0);
    assert_eq!(storage.delete_sessions_older_than(1000).await.unwrap(), 1);
}

async fn contract_cleanup_reports_counts(storage: &dyn StorageAdapter) {
    let mut old = delta("gc1", "gc-doc", "a", 1);
    old.timestamp = 10;
    storage.append_delta("gc-doc", old).await.unwrap();
    storage
        .save_session(SessionRecord {
            id: "gc-sess".into(),
            user_id: "u".into(),
            client_id: "c".into(),
            connected_at: 10,
            last_seen: 10,
            metadata: json!({}),
        })
        .await
        .unwrap();

    let report = storage
        .cleanup(CleanupOptions {
            deltas_before: Some(now_millis()),
            sessions_before: Some(now_millis()),
        })
        .await
        .unwrap();
    assert_eq!(report.deltas_removed, 1);
    assert_eq!(report.sessions_removed, 1);
}

async fn run_contract(storage: Arc<dyn StorageAdapter>) {
    contract_lazy_document(storage.as_ref()).await;
    contract_document_clock_is_merge_of_delta_clocks(storage.as_ref()).await;
    contract_deltas_since_own_clock_is_empty(storage.as_ref()).await;
    contract_idempotent_append(storage.as_ref()).await;
    contract_no_per_client_gaps(storage.as_ref()).await;
    contract_sessions(storage.as_ref()).await;
    contract_cleanup_reports_counts(storage.as_ref()).await;
    storage.health_check().await.unwrap();
}

#[tokio::test]
async fn test_memory_adapter_contract() {
    run_contract(Arc::new(MemoryStorage::new())).await;
}

#[tokio::test]
async fn test_concurrent_appends_stay_consistent() {
    let storage = Arc::new(MemoryStorage::new());
    let mut handles = Vec::new();
    for client_index in 0..8u64 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move {
            let client = format!("client-{client_index}");
            for counter in 1..=50u64 {
                let id = format!("{client}-{counter}");
                storage
                    .append_delta("hot-doc", delta(&id, "hot-doc", &client, counter))
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let deltas = storage.get_deltas_since("hot-doc", None).await.unwrap();
    assert_eq!(deltas.len(), 8 * 50);
    let clock = storage.get_document_clock("hot-doc").await.unwrap();
    for client_index in 0..8u64 {
        assert_eq!(clock.get(&format!("client-{client_index}")), 50);
    }
    // Append-then-read is read-your-writes on the same node.
    let pending = storage
        .get_deltas_since("hot-doc", Some(&clock))
        .await
        .unwrap();
    assert!(pending.is_empty());
}
