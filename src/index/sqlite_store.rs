// src/index/sqlite_store.rs
// SQLite-backed Index Store. Lexical search runs over an FTS5 shadow table;
// vector search is delegated to a pluggable VectorBackend (Qdrant in
// production, an in-memory brute-force backend in tests).

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use super::vector_backend::VectorBackend;
use super::{IdListing, IndexStore};
use crate::domain::{Record, RecordKind};
use crate::error::{EngineError, EngineResult};

pub struct SqliteIndexStore {
    pool: SqlitePool,
    vectors: Arc<dyn VectorBackend>,
    locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for f in v {
        out.extend_from_slice(&f.to_le_bytes());
    }
    out
}

fn blob_to_vec(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl SqliteIndexStore {
    pub fn new(pool: SqlitePool, vectors: Arc<dyn VectorBackend>) -> Self {
        Self {
            pool,
            vectors,
            locks: SyncMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> EngineResult<Record> {
        let attrs_json: String = row.get("attributes");
        let attributes: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&attrs_json).unwrap_or_default();
        let dense_blob: Option<Vec<u8>> = row.get("dense_vector");
        let updated_at_raw: String = row.get("updated_at");
        let kind_raw: String = row.get("kind");

        Ok(Record {
            id: row.get("id"),
            kind: kind_raw
                .parse()
                .map_err(|e: anyhow::Error| EngineError::invariant(e.to_string()))?,
            title: row.get("title"),
            body: row.get("body"),
            url: row.get("url"),
            brand: row.get("brand"),
            attributes,
            content_hash: row.get("content_hash"),
            dense_vector: dense_blob.map(|b| blob_to_vec(&b)),
            lexical_text: row.get("lexical_text"),
            active: row.get::<i64, _>("active") != 0,
            updated_at: chrono::DateTime::parse_from_rfc3339(&updated_at_raw)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            source_version: row.get("source_version"),
        })
    }
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn upsert(&self, record: Record) -> EngineResult<()> {
        let guard = self.lock_for(&record.id);
        let _permit = guard.lock().await;

        let record = record.with_recomputed_hash();
        let attrs_json = serde_json::to_string(&record.attributes).unwrap_or_default();
        let dense_blob = record.dense_vector.as_deref().map(vec_to_blob);
        let updated_at = record.updated_at.to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO records
                (id, kind, title, body, url, brand, attributes, content_hash,
                 dense_vector, lexical_text, active, updated_at, source_version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                title = excluded.title,
                body = excluded.body,
                url = excluded.url,
                brand = excluded.brand,
                attributes = excluded.attributes,
                content_hash = excluded.content_hash,
                dense_vector = excluded.dense_vector,
                lexical_text = excluded.lexical_text,
                active = 1,
                updated_at = excluded.updated_at,
                source_version = excluded.source_version
            "#,
        )
        .bind(&record.id)
        .bind(record.kind.as_str())
        .bind(&record.title)
        .bind(&record.body)
        .bind(&record.url)
        .bind(&record.brand)
        .bind(&attrs_json)
        .bind(&record.content_hash)
        .bind(&dense_blob)
        .bind(&record.lexical_text)
        .bind(&updated_at)
        .bind(&record.source_version)
        .execute(&self.pool)
        .await
        .map_err(EngineError::from)?;

        sqlx::query("DELETE FROM records_fts WHERE id = ?")
            .bind(&record.id)
            .execute(&self.pool)
            .await
            .map_err(EngineError::from)?;
        sqlx::query("INSERT INTO records_fts (id, title, lexical_text) VALUES (?, ?, ?)")
            .bind(&record.id)
            .bind(&record.title)
            .bind(&record.lexical_text)
            .execute(&self.pool)
            .await
            .map_err(EngineError::from)?;

        if let Some(vector) = &record.dense_vector {
            self.vectors.upsert(&record.id, record.kind, vector).await?;
        }

        debug!(id = %record.id, hash = %record.content_hash, "record upserted");
        Ok(())
    }

    async fn soft_delete(&self, id: &str) -> EngineResult<()> {
        let guard = self.lock_for(id);
        let _permit = guard.lock().await;

        let updated_at = Utc::now().to_rfc3339();
        sqlx::query("UPDATE records SET active = 0, dense_vector = NULL, updated_at = ? WHERE id = ?")
            .bind(&updated_at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(EngineError::from)?;

        self.vectors.delete(id).await?;
        Ok(())
    }

    async fn vector_search(
        &self,
        kind_filter: Option<RecordKind>,
        query_vec: &[f32],
        k: usize,
        min_score: f32,
    ) -> EngineResult<Vec<(String, f32)>> {
        self.vectors.search(kind_filter, query_vec, k, min_score).await
    }

    async fn text_search(
        &self,
        kind_filter: Option<RecordKind>,
        query_text: &str,
        k: usize,
    ) -> EngineResult<Vec<(String, f32)>> {
        if query_text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let fts_query = sanitize_fts_query(query_text);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let rows = if let Some(kind) = kind_filter {
            sqlx::query(
                r#"
                SELECT r.id AS id, -bm25(records_fts) AS score
                FROM records_fts
                JOIN records r ON r.id = records_fts.id
                WHERE records_fts MATCH ? AND r.active = 1 AND r.kind = ?
                ORDER BY score DESC
                LIMIT ?
                "#,
            )
            .bind(&fts_query)
            .bind(kind.as_str())
            .bind(k as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(EngineError::from)?
        } else {
            sqlx::query(
                r#"
                SELECT r.id AS id, -bm25(records_fts) AS score
                FROM records_fts
                JOIN records r ON r.id = records_fts.id
                WHERE records_fts MATCH ? AND r.active = 1
                ORDER BY score DESC
                LIMIT ?
                "#,
            )
            .bind(&fts_query)
            .bind(k as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(EngineError::from)?
        };

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("id"), row.get::<f64, _>("score") as f32))
            .collect())
    }

    async fn get_many(&self, ids: &[String]) -> EngineResult<Vec<Record>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let query = format!("SELECT * FROM records WHERE id IN ({placeholders})");
        let mut q = sqlx::query(&query);
        for id in ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(EngineError::from)?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn list_ids(&self, kind: RecordKind) -> EngineResult<Vec<IdListing>> {
        let rows = sqlx::query("SELECT id, content_hash, active FROM records WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(EngineError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("id"),
                    row.get::<String, _>("content_hash"),
                    row.get::<i64, _>("active") != 0,
                )
            })
            .collect())
    }

    async fn distinct_brands(&self) -> EngineResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT brand FROM records WHERE brand IS NOT NULL AND active = 1",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(EngineError::from)?;

        Ok(rows.into_iter().map(|row| row.get::<String, _>("brand")).collect())
    }
}

/// FTS5's MATCH syntax treats punctuation specially; strip anything that
/// isn't alphanumeric/whitespace and OR the remaining tokens together so a
/// free-text query degrades to "any of these words" rather than erroring on
/// a malformed query string.
fn sanitize_fts_query(input: &str) -> String {
    input
        .split_whitespace()
        .map(|tok| {
            tok.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|tok| !tok.is_empty())
        .map(|tok| format!("{tok}*"))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::vector_backend::in_memory::InMemoryVectorBackend;

    async fn test_store() -> SqliteIndexStore {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        SqliteIndexStore::new(pool, Arc::new(InMemoryVectorBackend::new()))
    }

    fn sample_record(id: &str) -> Record {
        let mut attributes = BTreeMap::new();
        attributes.insert("amperage".to_string(), serde_json::json!("16"));
        Record {
            id: id.to_string(),
            kind: RecordKind::Product,
            title: "Schneider A9P53616 IC40F 1P+N 16A C 6kA".to_string(),
            body: "Interruptor automatico schneider curva C 16 amperios".to_string(),
            url: None,
            brand: Some("Schneider".to_string()),
            attributes,
            content_hash: String::new(),
            dense_vector: Some(vec![0.1, 0.2, 0.3]),
            lexical_text: String::new(),
            active: true,
            updated_at: Utc::now(),
            source_version: None,
        }
    }

    #[tokio::test]
    async fn upsert_then_get_many_round_trips() {
        let store = test_store().await;
        store.upsert(sample_record("product:42")).await.unwrap();

        let found = store.get_many(&["product:42".to_string()]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].active);
        assert!(found[0].dense_vector.is_some());
    }

    #[tokio::test]
    async fn soft_delete_clears_dense_vector_and_deactivates() {
        let store = test_store().await;
        store.upsert(sample_record("product:42")).await.unwrap();
        store.soft_delete("product:42").await.unwrap();

        let found = store.get_many(&["product:42".to_string()]).await.unwrap();
        assert!(!found[0].active);
        assert!(found[0].dense_vector.is_none());
    }

    #[tokio::test]
    async fn text_search_matches_brand_and_curve_tokens() {
        let store = test_store().await;
        store.upsert(sample_record("product:42")).await.unwrap();

        let results = store
            .text_search(Some(RecordKind::Product), "schneider curva", 10)
            .await
            .unwrap();
        assert_eq!(results[0].0, "product:42");
    }

    #[tokio::test]
    async fn list_ids_reflects_hash_and_active_state() {
        let store = test_store().await;
        store.upsert(sample_record("product:42")).await.unwrap();

        let ids = store.list_ids(RecordKind::Product).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids[0].2);
    }

    #[tokio::test]
    async fn distinct_brands_only_counts_active_records() {
        let store = test_store().await;
        store.upsert(sample_record("product:42")).await.unwrap();
        store.soft_delete("product:42").await.unwrap();

        let brands = store.distinct_brands().await.unwrap();
        assert!(brands.is_empty());
    }
}
