// src/index/mod.rs
// Index Store (C4): owns durable Record state and exposes the hybrid query
// surface the Hybrid Retriever (C7) and Sync Engine (C5) depend on.

pub mod sqlite_store;
pub mod vector_backend;

use async_trait::async_trait;

use crate::domain::{Record, RecordKind};
use crate::error::EngineResult;

/// `(id, content_hash, active)` — the full listing used for reconciliation.
pub type IdListing = (String, String, bool);

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Writes the row, recomputing `lexical_vector`, and sets/clears
    /// `dense_vector` per the active-iff-indexed invariant.
    async fn upsert(&self, record: Record) -> EngineResult<()>;

    /// Sets `active=false` and clears `dense_vector`.
    async fn soft_delete(&self, id: &str) -> EngineResult<()>;

    /// Cosine similarity search, descending, filtered to records with
    /// `score >= min_score`.
    async fn vector_search(
        &self,
        kind_filter: Option<RecordKind>,
        query_vec: &[f32],
        k: usize,
        min_score: f32,
    ) -> EngineResult<Vec<(String, f32)>>;

    /// Language-aware ranked text match over `lexical_vector`.
    async fn text_search(
        &self,
        kind_filter: Option<RecordKind>,
        query_text: &str,
        k: usize,
    ) -> EngineResult<Vec<(String, f32)>>;

    async fn get_many(&self, ids: &[String]) -> EngineResult<Vec<Record>>;

    async fn list_ids(&self, kind: RecordKind) -> EngineResult<Vec<IdListing>>;

    /// Distinct `attributes.brand` values present for active records, used
    /// by C7 to build its refreshable brand token set.
    async fn distinct_brands(&self) -> EngineResult<Vec<String>>;
}
