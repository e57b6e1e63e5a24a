// src/config/catalog.rs
// Catalog provider configuration (C3)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub base_url: String,
    pub api_key: String,
    pub page_size: usize,
    pub max_concurrent_requests: usize,
    pub request_timeout_ms: u64,
    /// Path to the category taxonomy mapping file applied during Sync
    /// Engine normalization (§4.5 step 4). See `catalog::taxonomy`.
    pub taxonomy_path: String,
}

impl CatalogConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: super::helpers::env_or("CATALOG_BASE_URL", "http://localhost:4000"),
            api_key: super::helpers::env_or("CATALOG_API_KEY", ""),
            page_size: super::helpers::env_usize("CATALOG_PAGE_SIZE", 100),
            max_concurrent_requests: super::helpers::env_usize("CATALOG_MAX_CONCURRENT_REQUESTS", 8),
            request_timeout_ms: super::helpers::env_usize("CATALOG_REQUEST_TIMEOUT_MS", 15_000) as u64,
            taxonomy_path: super::helpers::env_or("CATALOG_TAXONOMY_PATH", "config/taxonomy.txt"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub shared_secret: String,
}

impl WebhookConfig {
    pub fn from_env() -> Self {
        Self {
            shared_secret: super::helpers::env_or("CATALOG_WEBHOOK_SECRET", ""),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    pub directory: String,
}

impl KnowledgeConfig {
    pub fn from_env() -> Self {
        Self {
            directory: super::helpers::env_or("KNOWLEDGE_DIR", "./knowledge"),
        }
    }
}
