// src/embeddings/mod.rs
// Embedding Client (C1): embed(texts) -> [Vector_D], batched, retried, deterministic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::embedding::EmbeddingConfig;
use crate::error::{EngineError, EngineResult};

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// output[i] corresponds to input[i]. Empty strings yield the zero vector.
    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>>;

    fn dimensions(&self) -> usize;

    /// Cheap reachability probe for `GET /health`. Never returns an error;
    /// unreachable degrades the service, it doesn't fail the health check.
    async fn health_check(&self) -> bool;
}

pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    config: EmbeddingConfig,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl HttpEmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .expect("failed to build embedding http client");
        Self { client, config }
    }

    fn api_url(&self) -> String {
        format!("{}/embeddings", self.config.base_url.trim_end_matches('/'))
    }

    /// Sends one batch and restores request order from the response's
    /// `index` field, since providers don't promise the response is ordered.
    async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let non_empty: Vec<String> = texts.iter().filter(|t| !t.is_empty()).cloned().collect();
        if non_empty.is_empty() {
            return Ok(vec![vec![0.0; self.config.dimensions]; texts.len()]);
        }

        let body = EmbeddingRequest {
            input: &non_empty,
            model: &self.config.model,
        };

        let response = self
            .client
            .post(self.api_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(EngineError::from)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(if status.is_client_error() {
                EngineError::Upstream4xx(format!("embedding provider {status}: {text}"))
            } else {
                EngineError::Transient(format!("embedding provider {status}: {text}"))
            });
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(EngineError::from)?;
        let mut ordered = vec![Vec::new(); non_empty.len()];
        for item in parsed.data {
            if item.index < ordered.len() {
                ordered[item.index] = item.embedding;
            }
        }
        for (i, v) in ordered.iter().enumerate() {
            if v.is_empty() {
                return Err(EngineError::invariant(format!(
                    "embedding provider omitted index {i}"
                )));
            }
        }

        // Re-interleave zero vectors for the original empty-string positions.
        let mut result = Vec::with_capacity(texts.len());
        let mut cursor = 0;
        for t in texts {
            if t.is_empty() {
                result.push(vec![0.0; self.config.dimensions]);
            } else {
                result.push(std::mem::take(&mut ordered[cursor]));
                cursor += 1;
            }
        }
        Ok(result)
    }

    async fn embed_batch_with_retry(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let mut attempt = 0u32;
        let mut delay = Duration::from_millis(self.config.retry_base_delay_ms);
        loop {
            match self.embed_batch(texts).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt + 1 < self.config.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "embedding batch failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_millis(self.config.retry_max_delay_ms));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut output = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.config.max_batch_size) {
            debug!(batch_size = chunk.len(), "embedding batch");
            let embedded = self.embed_batch_with_retry(chunk).await?;
            output.extend(embedded);
        }
        Ok(output)
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    async fn health_check(&self) -> bool {
        self.client
            .head(self.config.base_url.trim_end_matches('/'))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;

    /// Deterministic in-memory embedder for tests: hashes each string into a
    /// fixed-length vector so cosine similarity is reproducible without a
    /// network call.
    pub struct FakeEmbeddingClient {
        pub dimensions: usize,
    }

    #[async_trait]
    impl EmbeddingClient for FakeEmbeddingClient {
        async fn embed(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if t.is_empty() {
                        return vec![0.0; self.dimensions];
                    }
                    let hash = crate::utils::sha256_hash(t);
                    let bytes = hash.as_bytes();
                    (0..self.dimensions)
                        .map(|i| (bytes[i % bytes.len()] as f32) / 255.0)
                        .collect()
                })
                .collect())
        }

        fn dimensions(&self) -> usize {
            self.dimensions
        }

        async fn health_check(&self) -> bool {
            true
        }
    }
}
