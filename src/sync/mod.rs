// src/sync/mod.rs
// Sync Engine (C5): diffs the upstream catalog against the Index Store and
// applies the minimal set of upserts/deletes. Also owns the webhook-driven
// PendingChange queue for incremental, low-latency updates.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::catalog::taxonomy::TaxonomyMap;
use crate::catalog::CatalogFetcher;
use crate::domain::{Record, RecordKind};
use crate::embeddings::EmbeddingClient;
use crate::error::{EngineError, EngineResult};
use crate::index::IndexStore;

const PENDING_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Upsert,
    Delete,
}

impl ChangeOp {
    fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Upsert => "upsert",
            ChangeOp::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamEvent {
    pub kind: RecordKind,
    pub id: String,
    pub op: ChangeOp,
    /// Row id in the durable `pending_changes` table, when the event was
    /// enqueued via [`SyncEngine::enqueue_durable`] rather than pushed
    /// directly into the in-memory queue (as tests do).
    pub pending_change_id: Option<i64>,
}

#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    pub upserted: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

/// Bounded FIFO fed by `on_upstream_event`; overflow sheds the oldest entry
/// and the caller is expected to schedule a full reconcile as a safety net.
pub struct PendingQueue {
    inner: Mutex<VecDeque<UpstreamEvent>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn push(&self, event: UpstreamEvent) -> bool {
        let mut q = self.inner.lock().await;
        if q.len() >= PENDING_QUEUE_CAPACITY {
            q.pop_front();
            warn!("pending change queue overflow, oldest event dropped");
            q.push_back(event);
            false
        } else {
            q.push_back(event);
            true
        }
    }

    pub async fn pop(&self) -> Option<UpstreamEvent> {
        self.inner.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

pub struct SyncEngine {
    catalog: Arc<dyn CatalogFetcher>,
    index: Arc<dyn IndexStore>,
    embeddings: Arc<dyn EmbeddingClient>,
    taxonomy: TaxonomyMap,
    pub pending: Arc<PendingQueue>,
}

impl SyncEngine {
    pub fn new(
        catalog: Arc<dyn CatalogFetcher>,
        index: Arc<dyn IndexStore>,
        embeddings: Arc<dyn EmbeddingClient>,
    ) -> Self {
        Self::with_taxonomy(catalog, index, embeddings, TaxonomyMap::empty())
    }

    pub fn with_taxonomy(
        catalog: Arc<dyn CatalogFetcher>,
        index: Arc<dyn IndexStore>,
        embeddings: Arc<dyn EmbeddingClient>,
        taxonomy: TaxonomyMap,
    ) -> Self {
        Self {
            catalog,
            index,
            embeddings,
            taxonomy,
            pending: Arc::new(PendingQueue::new()),
        }
    }

    /// Full diff-and-converge pass for one record kind. Idempotent under
    /// crash: hash comparison makes a re-run of an already-converged kind a
    /// no-op.
    pub async fn reconcile(&self, kind: RecordKind) -> EngineResult<ReconcileReport> {
        let mut upstream: Vec<Record> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.catalog.list_since(kind, cursor.as_deref()).await?;
            if page.records.is_empty() {
                break;
            }
            let has_more = page.next_cursor.is_some();
            upstream.extend(page.records);
            cursor = page.next_cursor;
            if !has_more {
                break;
            }
        }

        let index_listing = self.index.list_ids(kind).await?;
        let index_by_id: std::collections::HashMap<String, (String, bool)> = index_listing
            .into_iter()
            .map(|(id, hash, active)| (id, (hash, active)))
            .collect();

        let upstream_ids: HashSet<String> = upstream.iter().map(|r| r.id.clone()).collect();

        let mut report = ReconcileReport::default();

        for batch in upstream.chunks(100) {
            let mut to_embed_idx = Vec::new();
            let mut normalized = Vec::with_capacity(batch.len());

            for record in batch {
                let mut normalized_record = record.clone();
                self.taxonomy.apply(&mut normalized_record);
                let normalized_record = normalized_record.with_recomputed_hash();
                let needs_embedding = match index_by_id.get(&normalized_record.id) {
                    Some((hash, active)) => hash != &normalized_record.content_hash || !active,
                    None => true,
                };
                if !needs_embedding {
                    report.unchanged += 1;
                } else {
                    to_embed_idx.push(normalized.len());
                }
                normalized.push(normalized_record);
            }

            if !to_embed_idx.is_empty() {
                let texts: Vec<String> = to_embed_idx
                    .iter()
                    .map(|&i| format!("{} {}", normalized[i].title, normalized[i].body))
                    .collect();
                let vectors = self.embeddings.embed(&texts).await?;
                for (slot, vector) in to_embed_idx.iter().zip(vectors.into_iter()) {
                    normalized[*slot].dense_vector = Some(vector);
                }
                for &i in &to_embed_idx {
                    self.index.upsert(normalized[i].clone()).await?;
                    report.upserted += 1;
                }
            }
        }

        for (id, (_, active)) in index_by_id.iter() {
            if *active && !upstream_ids.contains(id) {
                self.index.soft_delete(id).await?;
                report.deleted += 1;
            }
        }

        info!(
            kind = kind.as_str(),
            upserted = report.upserted,
            deleted = report.deleted,
            unchanged = report.unchanged,
            "reconcile complete"
        );
        Ok(report)
    }

    /// Enqueues a webhook-delivered mutation. Returns immediately; a
    /// background worker drains the queue. Not crash-safe on its own — see
    /// [`SyncEngine::enqueue_durable`] for the persisted variant used by the
    /// webhook handler.
    pub async fn on_upstream_event(&self, event: UpstreamEvent) {
        self.pending.push(event).await;
    }

    /// Persists the mutation to `pending_changes` (so it survives a crash
    /// before the in-memory queue drains it) and enqueues it for immediate
    /// processing.
    pub async fn enqueue_durable(
        &self,
        pool: &SqlitePool,
        kind: RecordKind,
        id: &str,
        op: ChangeOp,
        payload: Option<&str>,
    ) -> EngineResult<()> {
        let row = sqlx::query(
            "INSERT INTO pending_changes (record_id, kind, change_type, payload, received_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(op.as_str())
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;

        self.on_upstream_event(UpstreamEvent {
            kind,
            id: id.to_string(),
            op,
            pending_change_id: Some(row.last_insert_rowid()),
        })
        .await;
        Ok(())
    }

    /// Re-enqueues any `pending_changes` rows left unprocessed by a prior
    /// process (crash recovery), called once at startup.
    pub async fn requeue_unprocessed(&self, pool: &SqlitePool) -> EngineResult<usize> {
        let rows = sqlx::query(
            "SELECT id, record_id, kind, change_type FROM pending_changes WHERE processed_at IS NULL
             ORDER BY id ASC",
        )
        .fetch_all(pool)
        .await?;

        let count = rows.len();
        for row in rows {
            let kind_str: String = row.get("kind");
            let change_type: String = row.get("change_type");
            let Ok(kind) = kind_str.parse::<RecordKind>() else { continue };
            let op = if change_type == "delete" { ChangeOp::Delete } else { ChangeOp::Upsert };
            self.on_upstream_event(UpstreamEvent {
                kind,
                id: row.get("record_id"),
                op,
                pending_change_id: Some(row.get("id")),
            })
            .await;
        }
        if count > 0 {
            info!(count, "requeued unprocessed pending changes from prior run");
        }
        Ok(count)
    }

    /// Drains one pending event, applying the same normalization/embedding
    /// logic as `reconcile`. Intended to be called in a loop by a background
    /// worker with at-most-one in-flight per id (the Index Store's per-id
    /// lock already serializes concurrent writers for the same id).
    pub async fn drain_one(&self, pool: &SqlitePool) -> EngineResult<bool> {
        let Some(event) = self.pending.pop().await else {
            return Ok(false);
        };

        let result = self.apply_event(&event).await;

        if let (Ok(()), Some(pending_id)) = (&result, event.pending_change_id) {
            let _ = sqlx::query("UPDATE pending_changes SET processed_at = ? WHERE id = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(pending_id)
                .execute(pool)
                .await;
        }

        result.map(|()| true)
    }

    async fn apply_event(&self, event: &UpstreamEvent) -> EngineResult<()> {
        match event.op {
            ChangeOp::Delete => {
                self.index.soft_delete(&event.id).await?;
            }
            ChangeOp::Upsert => {
                let Some(mut record) = self.catalog.get(event.kind, &event.id).await? else {
                    return Err(EngineError::not_found(format!(
                        "catalog has no record for {}",
                        event.id
                    )));
                };
                self.taxonomy.apply(&mut record);
                let normalized = record.with_recomputed_hash();
                let existing = self.index.get_many(&[normalized.id.clone()]).await?;
                let needs_embedding = existing
                    .first()
                    .map(|r| r.content_hash != normalized.content_hash || !r.active)
                    .unwrap_or(true);

                let mut normalized = normalized;
                if needs_embedding {
                    let text = format!("{} {}", normalized.title, normalized.body);
                    let vectors = self.embeddings.embed(&[text]).await?;
                    normalized.dense_vector = vectors.into_iter().next();
                } else {
                    normalized.dense_vector = existing.into_iter().next().and_then(|r| r.dense_vector);
                }
                self.index.upsert(normalized).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fake::FakeCatalogFetcher;
    use crate::embeddings::fake::FakeEmbeddingClient;
    use crate::index::sqlite_store::SqliteIndexStore;
    use crate::index::vector_backend::in_memory::InMemoryVectorBackend;
    use std::collections::BTreeMap;

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample_record(id: &str) -> Record {
        Record {
            id: id.to_string(),
            kind: RecordKind::Product,
            title: "Schneider A9P53616".to_string(),
            body: "Interruptor automatico".to_string(),
            url: None,
            brand: Some("Schneider".to_string()),
            attributes: BTreeMap::new(),
            content_hash: String::new(),
            dense_vector: None,
            lexical_text: String::new(),
            active: true,
            updated_at: Utc::now(),
            source_version: None,
        }
    }

    fn test_engine(pool: SqlitePool, catalog: Arc<FakeCatalogFetcher>) -> SyncEngine {
        let vectors = Arc::new(InMemoryVectorBackend::new());
        let index: Arc<dyn IndexStore> = Arc::new(SqliteIndexStore::new(pool, vectors));
        let embeddings: Arc<dyn EmbeddingClient> = Arc::new(FakeEmbeddingClient { dimensions: 8 });
        SyncEngine::new(catalog, index, embeddings)
    }

    #[tokio::test]
    async fn enqueue_durable_persists_row_and_drain_marks_processed() {
        let pool = test_pool().await;
        let catalog = Arc::new(FakeCatalogFetcher::new());
        let record = sample_record("product:1");
        catalog
            .records
            .lock()
            .await
            .insert(RecordKind::Product, vec![record]);
        let engine = test_engine(pool.clone(), catalog);

        engine
            .enqueue_durable(&pool, RecordKind::Product, "product:1", ChangeOp::Delete, None)
            .await
            .unwrap();

        let unprocessed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_changes WHERE processed_at IS NULL",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(unprocessed, 1);

        let drained = engine.drain_one(&pool).await.unwrap();
        assert!(drained);

        let unprocessed_after: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_changes WHERE processed_at IS NULL",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(unprocessed_after, 0);
    }

    #[tokio::test]
    async fn requeue_unprocessed_restores_pending_changes_after_restart() {
        let pool = test_pool().await;

        sqlx::query(
            "INSERT INTO pending_changes (record_id, kind, change_type, payload, received_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind("product:9")
        .bind("product")
        .bind("delete")
        .bind(Option::<String>::None)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();

        let catalog = Arc::new(FakeCatalogFetcher::new());
        catalog
            .records
            .lock()
            .await
            .insert(RecordKind::Product, vec![sample_record("product:9")]);
        let engine = test_engine(pool.clone(), catalog);
        let requeued = engine.requeue_unprocessed(&pool).await.unwrap();
        assert_eq!(requeued, 1);
        assert_eq!(engine.pending.len().await, 1);

        let drained = engine.drain_one(&pool).await.unwrap();
        assert!(drained);

        let unprocessed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pending_changes WHERE processed_at IS NULL",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(unprocessed, 0);
    }

    #[tokio::test]
    async fn reconcile_upserts_new_records_and_is_idempotent() {
        let pool = test_pool().await;
        let catalog = Arc::new(FakeCatalogFetcher::new());
        catalog
            .records
            .lock()
            .await
            .insert(RecordKind::Product, vec![sample_record("product:1")]);
        let engine = test_engine(pool.clone(), catalog.clone());

        let first = engine.reconcile(RecordKind::Product).await.unwrap();
        assert_eq!(first.upserted, 1);
        assert_eq!(first.deleted, 0);

        let second = engine.reconcile(RecordKind::Product).await.unwrap();
        assert_eq!(second.upserted, 0);
        assert_eq!(second.unchanged, 1);
    }

    #[tokio::test]
    async fn reconcile_soft_deletes_records_missing_from_upstream() {
        let pool = test_pool().await;
        let catalog = Arc::new(FakeCatalogFetcher::new());
        catalog
            .records
            .lock()
            .await
            .insert(RecordKind::Product, vec![sample_record("product:1")]);
        let engine = test_engine(pool.clone(), catalog.clone());
        engine.reconcile(RecordKind::Product).await.unwrap();

        catalog.records.lock().await.insert(RecordKind::Product, vec![]);
        let report = engine.reconcile(RecordKind::Product).await.unwrap();
        assert_eq!(report.deleted, 1);
    }
}
