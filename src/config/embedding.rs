// src/config/embedding.rs
// Embedding provider configuration (C1)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub dimensions: usize,
    pub max_batch_size: usize,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl EmbeddingConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: super::helpers::env_or("EMBEDDING_BASE_URL", "https://api.openai.com/v1"),
            api_key: super::helpers::env_or("EMBEDDING_API_KEY", ""),
            model: super::helpers::env_or("EMBEDDING_MODEL", "text-embedding-3-small"),
            dimensions: super::helpers::env_usize("EMBEDDING_DIMENSIONS", 1536),
            max_batch_size: super::helpers::env_usize("EMBEDDING_MAX_BATCH_SIZE", 100),
            request_timeout_ms: super::helpers::env_usize("EMBEDDING_REQUEST_TIMEOUT_MS", 20_000) as u64,
            max_retries: super::helpers::env_usize("EMBEDDING_MAX_RETRIES", 5) as u32,
            retry_base_delay_ms: super::helpers::env_usize("EMBEDDING_RETRY_BASE_DELAY_MS", 500) as u64,
            retry_max_delay_ms: super::helpers::env_usize("EMBEDDING_RETRY_MAX_DELAY_MS", 30_000) as u64,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_key.is_empty() {
            anyhow::bail!("EMBEDDING_API_KEY must be set");
        }
        Ok(())
    }
}
