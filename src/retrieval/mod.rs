// src/retrieval/mod.rs
// Hybrid Retriever (C7): fuses vector and lexical ranking via RRF with
// brand/technical-term boosts. Never calls an LLM.

pub mod boosts;
pub mod rrf;

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{Record, RecordKind};
use crate::embeddings::EmbeddingClient;
use crate::error::EngineResult;
use crate::index::IndexStore;
use crate::config::retrieval::RetrievalConfig;

#[derive(Debug, Clone)]
pub struct ScoreComponents {
    pub rrf_score: f64,
    pub boost: f64,
}

#[derive(Debug, Clone)]
pub struct RetrievedRecord {
    pub record: Record,
    pub score: f64,
    pub components: ScoreComponents,
}

struct BrandCache {
    brands: Vec<String>,
    refreshed_at: Instant,
}

pub struct HybridRetriever {
    index: Arc<dyn IndexStore>,
    embeddings: Arc<dyn EmbeddingClient>,
    config: RetrievalConfig,
    brand_cache: RwLock<Option<BrandCache>>,
}

impl HybridRetriever {
    pub fn new(
        index: Arc<dyn IndexStore>,
        embeddings: Arc<dyn EmbeddingClient>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embeddings,
            config,
            brand_cache: RwLock::new(None),
        }
    }

    async fn brand_tokens(&self, normalized_query: &str) -> EngineResult<Vec<String>> {
        let ttl = std::time::Duration::from_secs(self.config.brand_cache_ttl_secs);

        {
            let guard = self.brand_cache.read().await;
            if let Some(cache) = guard.as_ref() {
                if cache.refreshed_at.elapsed() < ttl {
                    return Ok(boosts::extract_brand_tokens(normalized_query, &cache.brands));
                }
            }
        }

        let fresh = self.index.distinct_brands().await?;
        let mut guard = self.brand_cache.write().await;
        *guard = Some(BrandCache {
            brands: fresh.clone(),
            refreshed_at: Instant::now(),
        });
        Ok(boosts::extract_brand_tokens(normalized_query, &fresh))
    }

    /// Deterministic for a fixed store: same query, kind filter, and index
    /// contents always yield the same ordered result.
    pub async fn retrieve(
        &self,
        raw_query: &str,
        kind_filter: Option<RecordKind>,
    ) -> EngineResult<Vec<RetrievedRecord>> {
        let normalized = boosts::normalize_query(raw_query);
        let technical_terms = boosts::extract_technical_terms(raw_query);
        let brand_tokens = self.brand_tokens(&normalized).await?;

        let leg_k = self.config.candidates_per_leg * 2;

        let query_vector = self
            .embeddings
            .embed(&[normalized.clone()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let (vector_results, text_results) = tokio::try_join!(
            self.index
                .vector_search(kind_filter, &query_vector, leg_k, 0.25),
            self.index.text_search(kind_filter, &normalized, leg_k)
        )?;

        let fused = rrf::fuse(
            &vector_results,
            &text_results,
            self.config.rrf_k,
            self.config.weight_vector,
            self.config.weight_text,
        );

        if fused.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids: Vec<String> = fused.keys().cloned().collect();
        ids.sort();
        let records = self.index.get_many(&ids).await?;

        let mut scored: Vec<RetrievedRecord> = records
            .into_iter()
            .filter(|r| r.active)
            .filter_map(|record| {
                let rrf_score = *fused.get(&record.id)?;
                let boost = boosts::boost_for(&record, &brand_tokens, &technical_terms);
                let score = rrf_score + boost;
                Some(RetrievedRecord {
                    record,
                    score,
                    components: ScoreComponents { rrf_score, boost },
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.record.updated_at.cmp(&a.record.updated_at))
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        scored.truncate(self.config.top_k);

        debug!(
            query = raw_query,
            candidates = scored.len(),
            brand_tokens = brand_tokens.len(),
            technical_terms = technical_terms.len(),
            "retrieval complete"
        );

        Ok(scored)
    }
}

/// Maps a classified intent to the record kind(s) the retriever should
/// restrict to. `None` means search across all kinds.
pub fn kind_filter_for(intent: &str) -> Option<RecordKind> {
    match intent {
        "product_search" | "order_inquiry" => Some(RecordKind::Product),
        "knowledge_question" => Some(RecordKind::Knowledge),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::fake::FakeEmbeddingClient;
    use crate::index::vector_backend::in_memory::InMemoryVectorBackend;
    use crate::index::sqlite_store::SqliteIndexStore;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::BTreeMap;

    async fn test_retriever() -> HybridRetriever {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let vectors = Arc::new(InMemoryVectorBackend::new());
        let store = Arc::new(SqliteIndexStore::new(pool, vectors));
        let embeddings = Arc::new(FakeEmbeddingClient { dimensions: 16 });

        let mut attrs = BTreeMap::new();
        attrs.insert("brand".to_string(), serde_json::json!("Schneider"));
        attrs.insert("amperage".to_string(), serde_json::json!("20A"));
        let mut record = Record {
            id: "p1".to_string(),
            kind: RecordKind::Product,
            title: "Disyuntor Schneider 20A curva C".to_string(),
            body: "Disyuntor termomagnetico bipolar".to_string(),
            url: None,
            brand: Some("Schneider".to_string()),
            attributes: attrs,
            content_hash: String::new(),
            dense_vector: None,
            lexical_text: String::new(),
            active: true,
            updated_at: chrono::Utc::now(),
            source_version: None,
        }
        .with_recomputed_hash();
        let vector = embeddings
            .embed(&[format!("{} {}", record.title, record.body)])
            .await
            .unwrap()
            .remove(0);
        record.dense_vector = Some(vector);
        store.upsert(record).await.unwrap();

        HybridRetriever::new(store, embeddings, RetrievalConfig::from_env())
    }

    #[tokio::test]
    async fn retrieves_and_boosts_brand_and_technical_match() {
        let retriever = test_retriever().await;
        let results = retriever
            .retrieve("busco un disyuntor Schneider 20A curva C", None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].components.boost > 0.0);
    }

    #[tokio::test]
    async fn empty_store_returns_empty_results() {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let vectors = Arc::new(InMemoryVectorBackend::new());
        let store = Arc::new(SqliteIndexStore::new(pool, vectors));
        let embeddings = Arc::new(FakeEmbeddingClient { dimensions: 16 });
        let retriever = HybridRetriever::new(store, embeddings, RetrievalConfig::from_env());

        let results = retriever.retrieve("anything", None).await.unwrap();
        assert!(results.is_empty());
    }
}
