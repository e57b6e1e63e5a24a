// src/config/mod.rs
// Central configuration for the storefront assistant engine

pub mod catalog;
pub mod embedding;
pub mod helpers;
pub mod intent;
pub mod llm;
pub mod retrieval;
pub mod server;
pub mod session;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

lazy_static! {
    pub static ref CONFIG: EngineConfig = EngineConfig::from_env();
}

/// Composes every domain config. Constructed once at process start and read
/// through the `CONFIG` static everywhere else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub llm: llm::LlmConfig,
    pub embedding: embedding::EmbeddingConfig,
    pub catalog: catalog::CatalogConfig,
    pub webhook: catalog::WebhookConfig,
    pub knowledge: catalog::KnowledgeConfig,
    pub retrieval: retrieval::RetrievalConfig,
    pub vector_store: retrieval::VectorStoreConfig,
    pub intent: intent::IntentConfig,
    pub session: session::SessionConfig,
    pub server: server::ServerConfig,
    pub database: server::DatabaseConfig,
    pub logging: server::LoggingConfig,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            llm: llm::LlmConfig::from_env(),
            embedding: embedding::EmbeddingConfig::from_env(),
            catalog: catalog::CatalogConfig::from_env(),
            webhook: catalog::WebhookConfig::from_env(),
            knowledge: catalog::KnowledgeConfig::from_env(),
            retrieval: retrieval::RetrievalConfig::from_env(),
            vector_store: retrieval::VectorStoreConfig::from_env(),
            intent: intent::IntentConfig::from_env(),
            session: session::SessionConfig::from_env(),
            server: server::ServerConfig::from_env(),
            database: server::DatabaseConfig::from_env(),
            logging: server::LoggingConfig::from_env(),
        }
    }

    /// Validate config on startup. Only the external-provider credentials are
    /// mandatory; everything else has a workable default.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.llm.validate()?;
        self.embedding.validate()?;
        if self.retrieval.weight_vector <= 0.0 && self.retrieval.weight_text <= 0.0 {
            anyhow::bail!("retrieval weights cannot both be zero");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        self.server.bind_address()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
