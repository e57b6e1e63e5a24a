// src/state.rs
// Application state: wires C1-C13 together behind one `Arc`-cloneable
// struct shared across the HTTP/WS handlers and the background tasks.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

use crate::aggregator::MetricsAggregator;
use crate::catalog::taxonomy::TaxonomyMap;
use crate::catalog::{CatalogFetcher, HttpCatalogFetcher};
use crate::config::CONFIG;
use crate::embeddings::{EmbeddingClient, HttpEmbeddingClient};
use crate::index::sqlite_store::SqliteIndexStore;
use crate::index::vector_backend::qdrant_backend::QdrantVectorBackend;
use crate::index::IndexStore;
use crate::intent::IntentClassifier;
use crate::knowledge::KnowledgeLoader;
use crate::llmclient::{HttpLlmClient, LlmClient};
use crate::orchestrator::{self, ConversationOrchestrator};
use crate::refine::RefinementAgent;
use crate::retrieval::HybridRetriever;
use crate::session::SessionManager;
use crate::sync::SyncEngine;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub index: Arc<dyn IndexStore>,
    pub catalog: Arc<dyn CatalogFetcher>,
    pub embeddings: Arc<dyn EmbeddingClient>,
    pub llm: Arc<dyn LlmClient>,
    pub retriever: Arc<HybridRetriever>,
    pub sync_engine: Arc<SyncEngine>,
    pub knowledge_loader: Arc<KnowledgeLoader>,
    pub sessions: Arc<SessionManager>,
    pub orchestrator: Arc<ConversationOrchestrator>,
    pub aggregator: Arc<MetricsAggregator>,
}

impl AppState {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        CONFIG.validate()?;

        info!("connecting to vector store");
        let vectors = Arc::new(
            QdrantVectorBackend::new(
                &CONFIG.vector_store.url,
                &CONFIG.vector_store.collection,
                CONFIG.embedding.dimensions as u64,
            )
            .await?,
        );

        let index: Arc<dyn IndexStore> = Arc::new(SqliteIndexStore::new(pool.clone(), vectors));
        let catalog: Arc<dyn CatalogFetcher> = Arc::new(HttpCatalogFetcher::new(CONFIG.catalog.clone()));
        let embeddings: Arc<dyn EmbeddingClient> =
            Arc::new(HttpEmbeddingClient::new(CONFIG.embedding.clone()));
        let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(CONFIG.llm.clone()));

        let retriever = Arc::new(HybridRetriever::new(
            index.clone(),
            embeddings.clone(),
            CONFIG.retrieval.clone(),
        ));
        let taxonomy = TaxonomyMap::load(&CONFIG.catalog.taxonomy_path);
        let sync_engine = Arc::new(SyncEngine::with_taxonomy(
            catalog.clone(),
            index.clone(),
            embeddings.clone(),
            taxonomy,
        ));
        let knowledge_loader = Arc::new(KnowledgeLoader::new(index.clone(), embeddings.clone()));

        let sessions = Arc::new(SessionManager::new(pool.clone()));
        let intent_classifier = Arc::new(IntentClassifier::from_env(
            llm.clone(),
            &CONFIG.intent.escalation_phrases_path,
        ));
        let refiner = Arc::new(RefinementAgent::new(llm.clone()));

        let orchestrator = Arc::new(ConversationOrchestrator::new(
            intent_classifier,
            retriever.clone(),
            llm.clone(),
            refiner,
            sessions.clone(),
            CONFIG.session.clone(),
            CONFIG.retrieval.result_count_refine_threshold,
        ));

        let aggregator = Arc::new(MetricsAggregator::new(pool.clone()));

        Ok(Self {
            pool,
            index,
            catalog,
            embeddings,
            llm,
            retriever,
            sync_engine,
            knowledge_loader,
            sessions,
            orchestrator,
            aggregator,
        })
    }

    pub fn idle_threshold(&self) -> std::time::Duration {
        orchestrator::idle_threshold(&CONFIG.session)
    }
}
