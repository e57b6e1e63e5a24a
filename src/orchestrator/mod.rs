// src/orchestrator/mod.rs
// Conversation Orchestrator (C11): drives one turn through
// C8 -> C7 -> C9 -> (C10|C2), persists via C12, and serializes turns within
// a conversation while letting different conversations run concurrently.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use crate::config::session::SessionConfig;
use crate::error::{EngineError, EngineResult};
use crate::intent::{Intent, IntentClassifier};
use crate::llmclient::{CompletionMode, LlmClient, ModelTier};
use crate::metrics;
use crate::refine::RefinementAgent;
use crate::retrieval::{kind_filter_for, HybridRetriever, RetrievedRecord};
use crate::session::types::MessageRole;
use crate::session::SessionManager;
use crate::validate::{self, Decision};

const INBOUND_QUEUE_CAPACITY: usize = 4;
const CONSECUTIVE_FAILURE_ESCALATE: u32 = 3;

#[derive(Debug, Clone)]
pub struct TurnReply {
    pub text: String,
    pub decision_kind: &'static str,
    pub intent: &'static str,
}

struct QueuedTurn {
    text: String,
    reply_tx: oneshot::Sender<EngineResult<TurnReply>>,
}

struct ConversationQueue {
    pending: VecDeque<QueuedTurn>,
    processing: bool,
}

pub struct ConversationOrchestrator {
    intent_classifier: Arc<IntentClassifier>,
    retriever: Arc<HybridRetriever>,
    llm: Arc<dyn LlmClient>,
    refiner: Arc<RefinementAgent>,
    sessions: Arc<SessionManager>,
    session_config: SessionConfig,
    result_count_refine_threshold: usize,
    queues: Mutex<HashMap<String, Arc<Mutex<ConversationQueue>>>>,
    answer_failures: Mutex<HashMap<String, u32>>,
}

impl ConversationOrchestrator {
    pub fn new(
        intent_classifier: Arc<IntentClassifier>,
        retriever: Arc<HybridRetriever>,
        llm: Arc<dyn LlmClient>,
        refiner: Arc<RefinementAgent>,
        sessions: Arc<SessionManager>,
        session_config: SessionConfig,
        result_count_refine_threshold: usize,
    ) -> Self {
        Self {
            intent_classifier,
            retriever,
            llm,
            refiner,
            sessions,
            session_config,
            result_count_refine_threshold,
            queues: Mutex::new(HashMap::new()),
            answer_failures: Mutex::new(HashMap::new()),
        }
    }

    async fn queue_for(&self, conversation_id: &str) -> Arc<Mutex<ConversationQueue>> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ConversationQueue {
                    pending: VecDeque::new(),
                    processing: false,
                }))
            })
            .clone()
    }

    /// Enqueues `text` for `conversation_id` and awaits the produced reply.
    /// Serialized per conversation; bounded to [`INBOUND_QUEUE_CAPACITY`]
    /// pending turns, oldest dropped on overflow with a system note.
    ///
    /// Callers hold this orchestrator behind an `Arc` (the realtime gateway
    /// and HTTP handlers both do via `AppState`); the drain worker needs its
    /// own owned handle to keep running after `submit_turn` returns.
    pub async fn submit_turn(
        self: &Arc<Self>,
        conversation_id: &str,
        text: String,
    ) -> EngineResult<TurnReply> {
        let queue = self.queue_for(conversation_id).await;
        let (tx, rx) = oneshot::channel();

        let should_spawn = {
            let mut state = queue.lock().await;
            if state.pending.len() >= INBOUND_QUEUE_CAPACITY {
                if let Some(dropped) = state.pending.pop_front() {
                    warn!(conversation_id, "inbound queue full, dropping oldest pending turn");
                    let _ = self
                        .sessions
                        .append_message(
                            conversation_id,
                            MessageRole::System,
                            "A pending message was dropped because too many messages arrived too quickly.",
                            None,
                            None,
                            None,
                            None,
                            None,
                            None,
                        )
                        .await;
                    let _ = dropped
                        .reply_tx
                        .send(Err(EngineError::overload("turn dropped: inbound queue full")));
                }
            }
            state.pending.push_back(QueuedTurn { text, reply_tx: tx });
            if state.processing {
                false
            } else {
                state.processing = true;
                true
            }
        };

        if should_spawn {
            let this = Arc::clone(self);
            let conversation_id = conversation_id.to_string();
            tokio::spawn(async move {
                this.drain_queue(&conversation_id).await;
            });
        }

        rx.await
            .map_err(|_| EngineError::invariant("turn worker dropped without replying"))?
    }

    async fn drain_queue(&self, conversation_id: &str) {
        let queue = self.queue_for(conversation_id).await;
        loop {
            let next = {
                let mut state = queue.lock().await;
                match state.pending.pop_front() {
                    Some(turn) => Some(turn),
                    None => {
                        state.processing = false;
                        None
                    }
                }
            };
            let Some(turn) = next else { break };
            let result = self.process_turn(conversation_id, &turn.text).await;
            let _ = turn.reply_tx.send(result);
        }
    }

    async fn process_turn(&self, conversation_id: &str, text: &str) -> EngineResult<TurnReply> {
        let t0 = std::time::Instant::now();
        let metrics_timer = metrics::TurnTimer::new();

        let conversation = self
            .sessions
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("conversation {conversation_id}")))?;

        let recent = self.sessions.recent_messages(conversation_id, 5).await?;

        self.sessions
            .append_message(
                conversation_id,
                MessageRole::User,
                text,
                None,
                None,
                None,
                None,
                None,
                None,
            )
            .await?;

        let classification = self.intent_classifier.classify(text, &recent).await?;

        if classification.intent == Intent::EscalationRequest {
            let reply = handoff_template();
            let latency = t0.elapsed().as_secs_f64() * 1000.0;
            self.sessions
                .append_message(
                    conversation_id,
                    MessageRole::Assistant,
                    &reply,
                    Some("escalate"),
                    Some(classification.intent.as_str()),
                    Some(serde_json::to_value(&classification.entities).unwrap_or_default()),
                    Some(classification.confidence),
                    Some(latency),
                    None,
                )
                .await?;
            metrics::record_turn(classification.intent.as_str(), "escalate");
            metrics_timer.finish();
            return Ok(TurnReply {
                text: reply,
                decision_kind: "escalate",
                intent: classification.intent.as_str(),
            });
        }

        let kind_filter = kind_filter_for(classification.intent.as_str());
        let results = self.retriever.retrieve(text, kind_filter).await?;

        let failures = self.failure_count(conversation_id).await;
        let decision = validate::validate(
            classification.intent,
            &results,
            conversation.refine_count,
            failures,
            self.session_config.max_refine_turns,
            self.result_count_refine_threshold,
        );

        let (reply_text, decision_kind) = match &decision {
            Decision::Answer => {
                match self.synthesize(classification.intent, &results, &recent).await {
                    Ok(text) => {
                        self.reset_failures(conversation_id).await;
                        self.sessions.reset_refine_count(conversation_id).await?;
                        (text, "answer")
                    }
                    Err(e) => {
                        self.bump_failures(conversation_id).await;
                        warn!(conversation_id, error = %e, "synthesis failed");
                        (handoff_template(), "escalate")
                    }
                }
            }
            Decision::Refine(_) => {
                let question = self.refiner.ask(&results).await;
                self.sessions.increment_refine_count(conversation_id).await?;
                (question.question, "refine")
            }
            Decision::Escalate(reason) => {
                info!(conversation_id, reason, "escalating conversation");
                (handoff_template(), "escalate")
            }
        };

        let latency_ms = t0.elapsed().as_secs_f64() * 1000.0;
        self.sessions
            .append_message(
                conversation_id,
                MessageRole::Assistant,
                &reply_text,
                Some(decision_kind),
                Some(classification.intent.as_str()),
                Some(serde_json::to_value(&classification.entities).unwrap_or_default()),
                Some(classification.confidence),
                Some(latency_ms),
                None,
            )
            .await?;

        metrics::record_turn(classification.intent.as_str(), decision_kind);
        metrics_timer.finish();

        Ok(TurnReply {
            text: reply_text,
            decision_kind,
            intent: classification.intent.as_str(),
        })
    }

    async fn synthesize(
        &self,
        intent: Intent,
        results: &[RetrievedRecord],
        recent: &[crate::session::types::Message],
    ) -> EngineResult<String> {
        let mut prompt = format!(
            "You are a storefront support assistant. The customer's intent is {}.\n\nRelevant records:\n",
            intent.as_str()
        );
        for r in results.iter().take(5) {
            prompt.push_str(&format!("- {} ({}): {}\n", r.record.title, r.record.id, truncate(&r.record.body, 240)));
        }
        prompt.push_str("\nRecent conversation:\n");
        for msg in recent.iter().rev().take(5).collect::<Vec<_>>().into_iter().rev() {
            prompt.push_str(&format!("{}: {}\n", msg.role.as_str(), msg.content));
        }
        prompt.push_str("\nWrite a concise, friendly reply in Spanish grounded only in the records above.");

        let completion = self.llm.complete(&prompt, CompletionMode::Free, ModelTier::Standard).await?;
        completion
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| EngineError::invariant("synthesis did not return text"))
    }

    async fn failure_count(&self, conversation_id: &str) -> u32 {
        *self.answer_failures.lock().await.get(conversation_id).unwrap_or(&0)
    }

    async fn bump_failures(&self, conversation_id: &str) {
        let mut failures = self.answer_failures.lock().await;
        *failures.entry(conversation_id.to_string()).or_insert(0) += 1;
    }

    async fn reset_failures(&self, conversation_id: &str) {
        self.answer_failures.lock().await.remove(conversation_id);
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= max)
            .last()
            .unwrap_or(0);
        format!("{}...", &s[..cut])
    }
}

pub fn handoff_template() -> String {
    "Te estoy transfiriendo con una persona de nuestro equipo que puede ayudarte mejor con esto. En breve se pondrán en contacto contigo.".to_string()
}

pub fn idle_threshold(config: &SessionConfig) -> Duration {
    Duration::from_secs(config.idle_threshold_secs)
}

/// `CONSECUTIVE_FAILURE_ESCALATE` documents the table constant used by the
/// Result Validator call above; re-exported so tests can assert on it without
/// duplicating the literal.
pub const FAILURE_ESCALATION_THRESHOLD: u32 = CONSECUTIVE_FAILURE_ESCALATE;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::retrieval::RetrievalConfig;
    use crate::embeddings::fake::FakeEmbeddingClient;
    use crate::index::sqlite_store::SqliteIndexStore;
    use crate::index::vector_backend::in_memory::InMemoryVectorBackend;
    use crate::llmclient::fake::FakeLlmClient;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration as StdDuration;

    async fn wired_orchestrator() -> (Arc<ConversationOrchestrator>, Arc<SessionManager>) {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let vectors = Arc::new(InMemoryVectorBackend::new());
        let index = Arc::new(SqliteIndexStore::new(pool.clone(), vectors));
        let embeddings = Arc::new(FakeEmbeddingClient { dimensions: 8 });
        let llm = Arc::new(FakeLlmClient {
            structured: serde_json::json!({
                "intent": "greeting",
                "entities": {
                    "order_number": null, "email": null, "phone": null,
                    "brand": null, "category": null, "technical_specs": {}
                },
                "confidence": 0.95
            }),
            text: "¡Hola! ¿En qué puedo ayudarte?".to_string(),
        });

        let intent_classifier = Arc::new(IntentClassifier::new(llm.clone()));
        let retriever = Arc::new(HybridRetriever::new(index, embeddings, RetrievalConfig::from_env()));
        let refiner = Arc::new(RefinementAgent::new(llm.clone()));
        let sessions = Arc::new(SessionManager::new(pool));

        let orchestrator = Arc::new(ConversationOrchestrator::new(
            intent_classifier,
            retriever,
            llm,
            refiner,
            sessions.clone(),
            SessionConfig::from_env(),
            15,
        ));
        (orchestrator, sessions)
    }

    #[tokio::test]
    async fn greeting_with_empty_index_asks_to_refine() {
        // With nothing indexed, retrieval returns no candidates, so the
        // Result Validator's "R empty" branch fires regardless of intent.
        let (orchestrator, sessions) = wired_orchestrator().await;
        let (conv, _) = sessions
            .begin_or_resume("user-1", "web", "client-1", chrono::Utc::now(), StdDuration::from_secs(1800))
            .await
            .unwrap();

        let reply = orchestrator.submit_turn(&conv.id, "hola".to_string()).await.unwrap();
        assert_eq!(reply.decision_kind, "refine");
        assert_eq!(reply.intent, "greeting");
    }

    #[test]
    fn truncate_does_not_split_a_multibyte_char_at_the_boundary() {
        // "á" is 2 bytes; repeat it so byte 240 lands inside a character
        // rather than on its boundary, the way ordinary Spanish catalog
        // text routinely does.
        let body = "á".repeat(200);
        let truncated = truncate(&body, 240);
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= 244);
    }

    #[test]
    fn truncate_is_a_no_op_under_the_limit() {
        assert_eq!(truncate("short", 240), "short");
    }
}
