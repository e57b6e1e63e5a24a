// End-to-end conversation turns through the orchestrator (C11), wired to a
// real SQLite-backed session store (C12) and index (C4), with fakes standing
// in for the LLM/embeddings/catalog collaborators.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;

use storefront_engine::config::retrieval::RetrievalConfig;
use storefront_engine::config::session::SessionConfig;
use storefront_engine::domain::{Record, RecordKind};
use storefront_engine::embeddings::fake::FakeEmbeddingClient;
use storefront_engine::embeddings::EmbeddingClient;
use storefront_engine::index::sqlite_store::SqliteIndexStore;
use storefront_engine::index::vector_backend::in_memory::InMemoryVectorBackend;
use storefront_engine::index::IndexStore;
use storefront_engine::intent::IntentClassifier;
use storefront_engine::llmclient::fake::FakeLlmClient;
use storefront_engine::orchestrator::ConversationOrchestrator;
use storefront_engine::refine::RefinementAgent;
use storefront_engine::session::SessionManager;

fn product_search_llm(text: &str) -> Arc<FakeLlmClient> {
    Arc::new(FakeLlmClient {
        structured: serde_json::json!({
            "intent": "product_search",
            "entities": {
                "order_number": null, "email": null, "phone": null,
                "brand": "Acme", "category": null, "technical_specs": {}
            },
            "confidence": 0.9
        }),
        text: text.to_string(),
    })
}

async fn seeded_index() -> (Arc<dyn IndexStore>, FakeEmbeddingClient) {
    let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let vectors = Arc::new(InMemoryVectorBackend::new());
    let index: Arc<dyn IndexStore> = Arc::new(SqliteIndexStore::new(pool, vectors));
    let embeddings = FakeEmbeddingClient { dimensions: 8 };

    let mut attrs = BTreeMap::new();
    attrs.insert("brand".to_string(), serde_json::json!("Acme"));
    let mut record = Record {
        id: "p1".to_string(),
        kind: RecordKind::Product,
        title: "Acme Widget 20A".to_string(),
        body: "a sturdy widget".to_string(),
        url: None,
        brand: Some("Acme".to_string()),
        attributes: attrs,
        content_hash: String::new(),
        dense_vector: None,
        lexical_text: String::new(),
        active: true,
        updated_at: Utc::now(),
        source_version: None,
    }
    .with_recomputed_hash();
    let vector = embeddings
        .embed(&[format!("{} {}", record.title, record.body)])
        .await
        .unwrap()
        .remove(0);
    record.dense_vector = Some(vector);
    index.upsert(record).await.unwrap();
    (index, embeddings)
}

fn orchestrator_with(
    index: Arc<dyn IndexStore>,
    embeddings: FakeEmbeddingClient,
    retrieval_config: RetrievalConfig,
    llm: Arc<FakeLlmClient>,
    sessions: Arc<SessionManager>,
) -> Arc<ConversationOrchestrator> {
    let retriever = Arc::new(storefront_engine::retrieval::HybridRetriever::new(
        index,
        Arc::new(embeddings),
        retrieval_config,
    ));
    let intent_classifier = Arc::new(IntentClassifier::new(llm.clone()));
    let refiner = Arc::new(RefinementAgent::new(llm.clone()));
    Arc::new(ConversationOrchestrator::new(
        intent_classifier,
        retriever,
        llm,
        refiner,
        sessions.clone(),
        SessionConfig::from_env(),
        15,
    ))
}

#[tokio::test]
async fn strong_match_answers_on_the_first_turn() {
    // A near-zero RRF damping constant drives the top result's score well
    // past the 0.5 confidence floor, so the Result Validator answers
    // immediately instead of asking a clarifying question.
    let retrieval_config = RetrievalConfig {
        rrf_k: 0.0001,
        weight_vector: 0.5,
        weight_text: 0.5,
        boost_cap: 0.15,
        brand_cache_ttl_secs: 60,
        candidates_per_leg: 50,
        top_k: 10,
        result_count_refine_threshold: 15,
    };
    let (index, embeddings) = seeded_index().await;
    let llm = product_search_llm("We have the Acme Widget 20A in stock.");

    let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let sessions = Arc::new(SessionManager::new(pool));
    let orchestrator = orchestrator_with(index, embeddings, retrieval_config, llm, sessions.clone());

    let (conv, _) = sessions
        .begin_or_resume("user-1", "web", "client-1", Utc::now(), Duration::from_secs(1800))
        .await
        .unwrap();

    let reply = orchestrator.submit_turn(&conv.id, "do you have the 20A widget".to_string()).await.unwrap();
    assert_eq!(reply.decision_kind, "answer");
    assert_eq!(reply.intent, "product_search");
}

#[tokio::test]
async fn weak_match_refines_then_escalates_after_budget_exhausted() {
    // Default retrieval weighting keeps a single-record top score under the
    // refine-budget-exhausted threshold: SESSION_MAX_REFINE_TURNS defaults to
    // 2, so the third turn escalates instead of asking again.
    let retrieval_config = RetrievalConfig::from_env();
    let (index, embeddings) = seeded_index().await;
    let llm = product_search_llm("irrelevant, refine/escalate doesn't synthesize text");

    let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let sessions = Arc::new(SessionManager::new(pool));
    let orchestrator = orchestrator_with(index, embeddings, retrieval_config, llm, sessions.clone());

    let (conv, _) = sessions
        .begin_or_resume("user-2", "web", "client-2", Utc::now(), Duration::from_secs(1800))
        .await
        .unwrap();

    let first = orchestrator.submit_turn(&conv.id, "looking for a widget".to_string()).await.unwrap();
    assert_eq!(first.decision_kind, "refine");

    let second = orchestrator.submit_turn(&conv.id, "something cheaper".to_string()).await.unwrap();
    assert_eq!(second.decision_kind, "refine");

    let third = orchestrator.submit_turn(&conv.id, "anything at all".to_string()).await.unwrap();
    assert_eq!(third.decision_kind, "escalate");
}

#[tokio::test]
async fn escalation_phrase_short_circuits_the_llm_classifier() {
    let retrieval_config = RetrievalConfig::from_env();
    let (index, embeddings) = seeded_index().await;
    // A structured response that would classify as greeting if the
    // escalation precheck didn't short-circuit first.
    let llm = Arc::new(FakeLlmClient {
        structured: serde_json::json!({
            "intent": "greeting",
            "entities": {
                "order_number": null, "email": null, "phone": null,
                "brand": null, "category": null, "technical_specs": {}
            },
            "confidence": 0.95
        }),
        text: "hello".to_string(),
    });

    let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let sessions = Arc::new(SessionManager::new(pool));
    let orchestrator = orchestrator_with(index, embeddings, retrieval_config, llm, sessions.clone());

    let (conv, _) = sessions
        .begin_or_resume("user-3", "web", "client-3", Utc::now(), Duration::from_secs(1800))
        .await
        .unwrap();

    let reply = orchestrator
        .submit_turn(&conv.id, "I want to talk to a human, please".to_string())
        .await
        .unwrap();
    assert_eq!(reply.decision_kind, "escalate");
    assert_eq!(reply.intent, "escalation_request");
}
