// Full diff-and-converge pass over the catalog (C5): running reconcile
// twice with nothing changed upstream should be a no-op the second time,
// and removing an item upstream should soft-delete it in the index.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;

use storefront_engine::catalog::fake::FakeCatalogFetcher;
use storefront_engine::domain::{Record, RecordKind};
use storefront_engine::embeddings::fake::FakeEmbeddingClient;
use storefront_engine::embeddings::EmbeddingClient;
use storefront_engine::index::sqlite_store::SqliteIndexStore;
use storefront_engine::index::vector_backend::in_memory::InMemoryVectorBackend;
use storefront_engine::index::IndexStore;
use storefront_engine::sync::SyncEngine;

fn sample_record(id: &str, title: &str) -> Record {
    Record {
        id: id.to_string(),
        kind: RecordKind::Product,
        title: title.to_string(),
        body: "a sturdy widget".to_string(),
        url: None,
        brand: Some("Acme".to_string()),
        attributes: BTreeMap::new(),
        content_hash: String::new(),
        dense_vector: None,
        lexical_text: String::new(),
        active: true,
        updated_at: Utc::now(),
        source_version: None,
    }
}

async fn engine_with_catalog(
    records: Vec<Record>,
) -> (SyncEngine, Arc<dyn IndexStore>, Arc<FakeCatalogFetcher>) {
    let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let vectors = Arc::new(InMemoryVectorBackend::new());
    let index: Arc<dyn IndexStore> = Arc::new(SqliteIndexStore::new(pool, vectors));
    let embeddings: Arc<dyn EmbeddingClient> = Arc::new(FakeEmbeddingClient { dimensions: 8 });

    let catalog = Arc::new(FakeCatalogFetcher::new());
    catalog.records.lock().await.insert(RecordKind::Product, records);

    let engine = SyncEngine::new(catalog.clone(), index.clone(), embeddings);
    (engine, index, catalog)
}

#[tokio::test]
async fn second_reconcile_pass_is_a_no_op() {
    let (engine, _index, _catalog) =
        engine_with_catalog(vec![sample_record("p1", "Widget A"), sample_record("p2", "Widget B")]).await;

    let first = engine.reconcile(RecordKind::Product).await.unwrap();
    assert_eq!(first.upserted, 2);
    assert_eq!(first.deleted, 0);
    assert_eq!(first.unchanged, 0);

    let second = engine.reconcile(RecordKind::Product).await.unwrap();
    assert_eq!(second.upserted, 0);
    assert_eq!(second.deleted, 0);
    assert_eq!(second.unchanged, 2);
}

#[tokio::test]
async fn record_removed_upstream_is_soft_deleted() {
    let (engine, index, catalog) =
        engine_with_catalog(vec![sample_record("p1", "Widget A"), sample_record("p2", "Widget B")]).await;

    engine.reconcile(RecordKind::Product).await.unwrap();

    catalog.records.lock().await.insert(RecordKind::Product, vec![sample_record("p1", "Widget A")]);

    let report = engine.reconcile(RecordKind::Product).await.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.unchanged, 1);

    let listing = index.list_ids(RecordKind::Product).await.unwrap();
    let p2 = listing.iter().find(|(id, _, _)| id == "p2").unwrap();
    assert!(!p2.2, "p2 should be inactive after soft delete");
}

#[tokio::test]
async fn changed_title_triggers_re_embed_and_upsert() {
    let (engine, _index, catalog) = engine_with_catalog(vec![sample_record("p1", "Widget A")]).await;
    engine.reconcile(RecordKind::Product).await.unwrap();

    catalog.records.lock().await.insert(RecordKind::Product, vec![sample_record("p1", "Widget A, now waterproof")]);

    let report = engine.reconcile(RecordKind::Product).await.unwrap();
    assert_eq!(report.upserted, 1);
    assert_eq!(report.unchanged, 0);
}
