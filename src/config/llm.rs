// src/config/llm.rs
// LLM completion provider configuration (C2)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub fast_model: String,
    pub deep_model: String,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: super::helpers::env_or("LLM_BASE_URL", "https://api.openai.com/v1"),
            api_key: super::helpers::env_or("LLM_API_KEY", ""),
            fast_model: super::helpers::env_or("LLM_FAST_MODEL", "gpt-4o-mini"),
            deep_model: super::helpers::env_or("LLM_DEEP_MODEL", "gpt-4o"),
            request_timeout_ms: super::helpers::env_usize("LLM_REQUEST_TIMEOUT_MS", 20_000) as u64,
            max_retries: super::helpers::env_usize("LLM_MAX_RETRIES", 3) as u32,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_key.is_empty() {
            anyhow::bail!("LLM_API_KEY must be set");
        }
        Ok(())
    }
}
