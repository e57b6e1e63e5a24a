// src/config/retrieval.rs
// Hybrid retrieval tuning (C7)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// RRF rank-damping constant.
    pub rrf_k: f64,
    /// RRF weight given to the vector-search rank.
    pub weight_vector: f64,
    /// RRF weight given to the lexical-search rank.
    pub weight_text: f64,
    /// Max additive score bump from a brand/technical-term match.
    pub boost_cap: f64,
    /// How long the runtime brand set is cached before being rebuilt from the index.
    pub brand_cache_ttl_secs: u64,
    /// Candidates requested from each of the vector/text legs before fusion.
    pub candidates_per_leg: usize,
    /// Final result count returned to the caller.
    pub top_k: usize,
    /// `|R|` above this is considered "too broad" by the Result Validator and
    /// triggers an attribute-based refinement instead of answering directly.
    pub result_count_refine_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    pub url: String,
    pub collection: String,
}

impl VectorStoreConfig {
    pub fn from_env() -> Self {
        Self {
            url: super::helpers::env_or("QDRANT_URL", "http://localhost:6334"),
            collection: super::helpers::env_or("QDRANT_COLLECTION", "storefront_records"),
        }
    }
}

impl RetrievalConfig {
    pub fn from_env() -> Self {
        Self {
            rrf_k: super::helpers::env_usize("RETRIEVAL_RRF_K", 60) as f64,
            weight_vector: std::env::var("RETRIEVAL_WEIGHT_VECTOR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.6),
            weight_text: std::env::var("RETRIEVAL_WEIGHT_TEXT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.4),
            boost_cap: std::env::var("RETRIEVAL_BOOST_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.15),
            brand_cache_ttl_secs: super::helpers::env_usize("RETRIEVAL_BRAND_CACHE_TTL_SECS", 60) as u64,
            candidates_per_leg: super::helpers::env_usize("RETRIEVAL_CANDIDATES_PER_LEG", 50),
            top_k: super::helpers::env_usize("RETRIEVAL_TOP_K", 10),
            result_count_refine_threshold: super::helpers::env_usize(
                "RETRIEVAL_RESULT_COUNT_REFINE_THRESHOLD",
                15,
            ),
        }
    }
}
