//! Postgres storage adapter (sqlx).
//!
//! Normalized schema, clocks as JSONB:
//! - `documents(id, created_at, updated_at, vector_clock)`
//! - `deltas(seq, id, document_id, client_id, payload, clock_value,
//!   "timestamp", vector_clock)` — unique on `id` (idempotent append),
//!   composite index `(document_id, client_id, clock_value)` for causal
//!   queries, `seq` preserves append order.
//! - `sessions(id, user_id, client_id, connected_at, last_seen,
//!   metadata)`
//!
//! `validate_schema` checks the expected columns against
//! `information_schema` at startup so a half-migrated database fails
//! fast instead of corrupting clocks at runtime.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;

use crate::clock::VectorClock;
use crate::protocol::now_millis;

use super::{
    CleanupOptions, CleanupReport, DocumentRecord, SessionRecord, StorageAdapter,
    StorageError, StoredDelta,
};

const EXPECTED_COLUMNS: &[(&str, &[&str])] = &[
    ("documents", &["id", "created_at", "updated_at", "vector_clock"]),
    (
        "deltas",
        &[
            "seq",
            "id",
            "document_id",
            "client_id",
            "payload",
            "clock_value",
            "timestamp",
            "vector_clock",
        ],
    ),
    (
        "sessions",
        &["id", "user_id", "client_id", "connected_at", "last_seen", "metadata"],
    ),
];

const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS documents (
        id           TEXT PRIMARY KEY,
        created_at   BIGINT NOT NULL,
        updated_at   BIGINT NOT NULL,
        vector_clock JSONB  NOT NULL DEFAULT '{}'::jsonb
    )"#,
    r#"CREATE TABLE IF NOT EXISTS deltas (
        seq          BIGSERIAL PRIMARY KEY,
        id           TEXT   NOT NULL UNIQUE,
        document_id  TEXT   NOT NULL REFERENCES documents(id),
        client_id    TEXT   NOT NULL,
        payload      JSONB  NOT NULL,
        clock_value  BIGINT NOT NULL,
        "timestamp"  BIGINT NOT NULL,
        vector_clock JSONB  NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS deltas_causal_idx
        ON deltas (document_id, client_id, clock_value)"#,
    r#"CREATE TABLE IF NOT EXISTS sessions (
        id           TEXT   PRIMARY KEY,
        user_id      TEXT   NOT NULL,
        client_id    TEXT   NOT NULL,
        connected_at BIGINT NOT NULL,
        last_seen    BIGINT NOT NULL,
        metadata     JSONB  NOT NULL DEFAULT '{}'::jsonb
    )"#,
    r#"CREATE INDEX IF NOT EXISTS sessions_user_idx ON sessions (user_id)"#,
];

/// Postgres-backed storage.
pub struct RelationalStorage {
    pool: PgPool,
}

impl RelationalStorage {
    /// Connect, apply idempotent migrations, validate the schema.
    pub async fn connect(connection_string: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(connection_string)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        let storage = Self { pool };
        storage.migrate().await?;
        storage.validate_schema().await?;
        Ok(storage)
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Compare live columns against [`EXPECTED_COLUMNS`].
    pub async fn validate_schema(&self) -> Result<(), StorageError> {
        let rows = sqlx::query(
            "SELECT table_name, column_name FROM information_schema.columns
             WHERE table_schema = current_schema()
               AND table_name = ANY($1)",
        )
        .bind(
            EXPECTED_COLUMNS
                .iter()
                .map(|(t, _)| t.to_string())
                .collect::<Vec<_>>(),
        )
        .fetch_all(&self.pool)
        .await?;

        let mut live: HashMap<String, HashSet<String>> = HashMap::new();
        for row in rows {
            let table: String = row.try_get("table_name")?;
            let column: String = row.try_get("column_name")?;
            live.entry(table).or_default().insert(column);
        }

        for (table, columns) in EXPECTED_COLUMNS {
            let Some(found) = live.get(*table) else {
                return Err(StorageError::SchemaMismatch(format!(
                    "missing table {table}"
                )));
            };
            for column in *columns {
                if !found.contains(*column) {
                    return Err(StorageError::SchemaMismatch(format!(
                        "table {table} is missing column {column}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn document_from_row(row: &PgRow) -> Result<DocumentRecord, StorageError> {
        Ok(DocumentRecord {
            id: row.try_get("id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            vector_clock: row.try_get::<Json<VectorClock>, _>("vector_clock")?.0,
        })
    }

    fn delta_from_row(row: &PgRow) -> Result<StoredDelta, StorageError> {
        Ok(StoredDelta {
            id: row.try_get("id")?,
            document_id: row.try_get("document_id")?,
            origin_client_id: row.try_get("client_id")?,
            vector_clock: row.try_get::<Json<VectorClock>, _>("vector_clock")?.0,
            payload: row.try_get::<Json<Value>, _>("payload")?.0,
            timestamp: row.try_get("timestamp")?,
        })
    }

    fn session_from_row(row: &PgRow) -> Result<SessionRecord, StorageError> {
        Ok(SessionRecord {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            client_id: row.try_get("client_id")?,
            connected_at: row.try_get("connected_at")?,
            last_seen: row.try_get("last_seen")?,
            metadata: row.try_get::<Json<Value>, _>("metadata")?.0,
        })
    }
}

#[async_trait]
impl StorageAdapter for RelationalStorage {
    async fn get_or_create_document(
        &self,
        document_id: &str,
    ) -> Result<DocumentRecord, StorageError> {
        let now = now_millis();
        sqlx::query(
            "INSERT INTO documents (id, created_at, updated_at, vector_clock)
             VALUES ($1, $2, $2, '{}'::jsonb)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(document_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM documents WHERE id = $1")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Self::document_from_row(&row)
    }

    async fn get_document(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = $1")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::document_from_row).transpose()
    }

    async fn append_delta(
        &self,
        document_id: &str,
        delta: StoredDelta,
    ) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await?;

        // Row-lock the document so clock merge + append is atomic.
        let row = sqlx::query("SELECT vector_clock FROM documents WHERE id = $1 FOR UPDATE")
            .bind(document_id)
            .fetch_optional(&mut *tx)
            .await?;
        let mut document_clock = match row {
            Some(row) => row.try_get::<Json<VectorClock>, _>("vector_clock")?.0,
            None => {
                let now = now_millis();
                sqlx::query(
                    "INSERT INTO documents (id, created_at, updated_at, vector_clock)
                     VALUES ($1, $2, $2, '{}'::jsonb)",
                )
                .bind(document_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                VectorClock::new()
            }
        };

        let inserted = sqlx::query(
            r#"INSERT INTO deltas
               (id, document_id, client_id, payload, clock_value, "timestamp", vector_clock)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               ON CONFLICT (id) DO NOTHING"#,
        )
        .bind(&delta.id)
        .bind(document_id)
        .bind(&delta.origin_client_id)
        .bind(Json(&delta.payload))
        .bind(delta.vector_clock.get(&delta.origin_client_id) as i64)
        .bind(delta.timestamp)
        .bind(Json(&delta.vector_clock))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        document_clock.merge(&delta.vector_clock);
        sqlx::query("UPDATE documents SET vector_clock = $2, updated_at = $3 WHERE id = $1")
            .bind(document_id)
            .bind(Json(&document_clock))
            .bind(now_millis())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_deltas_since(
        &self,
        document_id: &str,
        since: Option<&VectorClock>,
    ) -> Result<Vec<StoredDelta>, StorageError> {
        let rows = sqlx::query("SELECT * FROM deltas WHERE document_id = $1 ORDER BY seq")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        let mut deltas = Vec::with_capacity(rows.len());
        for row in &rows {
            let delta = Self::delta_from_row(row)?;
            match since {
                Some(clock) if delta.vector_clock.observed_by(clock) => {}
                _ => deltas.push(delta),
            }
        }
        Ok(deltas)
    }

    async fn get_document_clock(
        &self,
        document_id: &str,
    ) -> Result<VectorClock, StorageError> {
        let row = sqlx::query("SELECT vector_clock FROM documents WHERE id = $1")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<Json<VectorClock>, _>("vector_clock")?.0),
            None => Ok(VectorClock::new()),
        }
    }

    async fn count_documents(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn save_session(&self, session: SessionRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, client_id, connected_at, last_seen, metadata)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET last_seen = EXCLUDED.last_seen",
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.client_id)
        .bind(session.connected_at)
        .bind(session.last_seen)
        .bind(Json(&session.metadata))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_session_last_seen(
        &self,
        session_id: &str,
        last_seen: i64,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE sessions SET last_seen = $2 WHERE id = $1")
            .bind(session_id)
            .bind(last_seen)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_sessions_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<SessionRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE user_id = $1 ORDER BY connected_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::session_from_row).collect()
    }

    async fn delete_sessions_older_than(&self, cutoff: i64) -> Result<u64, StorageError> {
        let removed = sqlx::query("DELETE FROM sessions WHERE last_seen < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    async fn cleanup(&self, options: CleanupOptions) -> Result<CleanupReport, StorageError> {
        let mut report = CleanupReport::default();
        if let Some(cutoff) = options.deltas_before {
            report.deltas_removed = sqlx::query(r#"DELETE FROM deltas WHERE "timestamp" < $1"#)
                .bind(cutoff)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        if let Some(cutoff) = options.sessions_before {
            report.sessions_removed = self.delete_sessions_older_than(cutoff).await?;
        }
        Ok(report)
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
