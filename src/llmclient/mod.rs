// src/llmclient/mod.rs
// LLM Client (C2): complete(prompt, mode, schema?) -> String | StructuredValue.
// Only length, latency and tier are ever logged — never prompt content.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::llm::LlmConfig;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Cheap,
    Standard,
    Strong,
}

#[derive(Debug, Clone)]
pub enum CompletionMode {
    Free,
    JsonSchema(Value),
}

#[derive(Debug, Clone)]
pub enum Completion {
    Text(String),
    Structured(Value),
}

impl Completion {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Completion::Text(t) => Some(t),
            Completion::Structured(_) => None,
        }
    }

    pub fn into_structured(self) -> Option<Value> {
        match self {
            Completion::Structured(v) => Some(v),
            Completion::Text(_) => None,
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        mode: CompletionMode,
        tier: ModelTier,
    ) -> EngineResult<Completion>;

    /// Cheap reachability probe for `GET /health`. Never returns an error;
    /// unreachable degrades the service, it doesn't fail the health check.
    async fn health_check(&self) -> bool;
}

pub struct HttpLlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    json_schema: JsonSchemaWrapper<'a>,
}

#[derive(Debug, Serialize)]
struct JsonSchemaWrapper<'a> {
    name: &'a str,
    schema: &'a Value,
    strict: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

impl HttpLlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .expect("failed to build llm http client");
        Self { client, config }
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Cheap | ModelTier::Standard => &self.config.fast_model,
            ModelTier::Strong => &self.config.deep_model,
        }
    }

    async fn call_once(
        &self,
        prompt: &str,
        mode: &CompletionMode,
        tier: ModelTier,
    ) -> EngineResult<String> {
        let response_format = match mode {
            CompletionMode::Free => None,
            CompletionMode::JsonSchema(schema) => Some(ResponseFormat {
                kind: "json_schema",
                json_schema: JsonSchemaWrapper {
                    name: "response",
                    schema,
                    strict: true,
                },
            }),
        };

        let body = ChatRequest {
            model: self.model_for(tier),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            response_format,
        };

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(EngineError::from)?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(if status.is_client_error() {
                EngineError::Upstream4xx(format!("llm provider {status}"))
            } else {
                EngineError::Transient(format!("llm provider {status}"))
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(EngineError::from)?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EngineError::invariant("llm provider returned no choices"))
    }
}

const MAX_SCHEMA_ATTEMPTS: u32 = 3;

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(
        &self,
        prompt: &str,
        mode: CompletionMode,
        tier: ModelTier,
    ) -> EngineResult<Completion> {
        let t0 = Instant::now();
        let prompt_len = prompt.len();

        match &mode {
            CompletionMode::Free => {
                let text = self.call_once(prompt, &mode, tier).await?;
                debug!(prompt_len, latency_ms = t0.elapsed().as_millis(), tier = ?tier, "llm completion");
                Ok(Completion::Text(text))
            }
            CompletionMode::JsonSchema(_) => {
                let mut last_err = None;
                for attempt in 1..=MAX_SCHEMA_ATTEMPTS {
                    let text = self.call_once(prompt, &mode, tier).await?;
                    match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            debug!(prompt_len, latency_ms = t0.elapsed().as_millis(), tier = ?tier, attempt, "llm json completion");
                            return Ok(Completion::Structured(value));
                        }
                        Err(e) => {
                            warn!(attempt, error = %e, "llm response failed schema validation");
                            last_err = Some(e);
                        }
                    }
                }
                Err(EngineError::invariant(format!(
                    "llm response failed schema validation after {MAX_SCHEMA_ATTEMPTS} attempts: {:?}",
                    last_err
                )))
            }
        }
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

    /// Returns a canned structured/text response without a network call.
    pub struct FakeLlmClient {
        pub structured: Value,
        pub text: String,
    }

    #[async_trait]
    impl LlmClient for FakeLlmClient {
        async fn complete(
            &self,
            _prompt: &str,
            mode: CompletionMode,
            _tier: ModelTier,
        ) -> EngineResult<Completion> {
            match mode {
                CompletionMode::Free => Ok(Completion::Text(self.text.clone())),
                CompletionMode::JsonSchema(_) => Ok(Completion::Structured(self.structured.clone())),
            }
        }

        async fn health_check(&self) -> bool {
            true
        }
    }
}
