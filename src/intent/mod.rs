// src/intent/mod.rs
// Intent Classifier (C8): closed intent set, entity bag, and the
// deterministic escalation pre-check that bypasses the LLM entirely.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::llmclient::{Completion, CompletionMode, LlmClient, ModelTier};
use crate::session::types::Message;

pub const CONFIDENCE_FLOOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    ProductSearch,
    OrderInquiry,
    KnowledgeQuestion,
    EscalationRequest,
    Greeting,
    Farewell,
    SmallTalk,
    Unsupported,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::ProductSearch => "product_search",
            Intent::OrderInquiry => "order_inquiry",
            Intent::KnowledgeQuestion => "knowledge_question",
            Intent::EscalationRequest => "escalation_request",
            Intent::Greeting => "greeting",
            Intent::Farewell => "farewell",
            Intent::SmallTalk => "small_talk",
            Intent::Unsupported => "unsupported",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "product_search" => Some(Intent::ProductSearch),
            "order_inquiry" => Some(Intent::OrderInquiry),
            "knowledge_question" => Some(Intent::KnowledgeQuestion),
            "escalation_request" => Some(Intent::EscalationRequest),
            "greeting" => Some(Intent::Greeting),
            "farewell" => Some(Intent::Farewell),
            "small_talk" => Some(Intent::SmallTalk),
            "unsupported" => Some(Intent::Unsupported),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entities {
    pub order_number: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub brand: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub technical_specs: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub intent: Intent,
    pub entities: Entities,
    pub confidence: f64,
    pub needs_refinement: bool,
}

/// Configurable data, not code: exact-insensitive phrase match short-circuits
/// straight to `escalation_request` before any LLM call.
pub const DEFAULT_ESCALATION_PHRASES: &[&str] = &[
    "hablar con una persona",
    "quiero hablar con una persona",
    "hablar con un humano",
    "talk to a human",
    "talk to a person",
    "speak to a representative",
    "reembolso",
    "refund",
    "garantia",
    "warranty",
    "devolucion",
    "return my order",
];

fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "intent": {
                "type": "string",
                "enum": [
                    "product_search", "order_inquiry", "knowledge_question",
                    "escalation_request", "greeting", "farewell", "small_talk", "unsupported"
                ]
            },
            "entities": {
                "type": "object",
                "properties": {
                    "order_number": {"type": ["string", "null"]},
                    "email": {"type": ["string", "null"]},
                    "phone": {"type": ["string", "null"]},
                    "brand": {"type": ["string", "null"]},
                    "category": {"type": ["string", "null"]},
                    "technical_specs": {"type": "object"}
                },
                "required": ["order_number", "email", "phone", "brand", "category", "technical_specs"]
            },
            "confidence": {"type": "number"}
        },
        "required": ["intent", "entities", "confidence"]
    })
}

pub struct IntentClassifier {
    llm: Arc<dyn LlmClient>,
    escalation_phrases: Vec<String>,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            escalation_phrases: DEFAULT_ESCALATION_PHRASES
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
        }
    }

    pub fn with_escalation_phrases(llm: Arc<dyn LlmClient>, phrases: Vec<String>) -> Self {
        Self {
            llm,
            escalation_phrases: phrases.into_iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    /// Loads the phrase list from `path` (one phrase per line, `#` comments
    /// and blank lines ignored). Falls back to `DEFAULT_ESCALATION_PHRASES`
    /// and logs a warning if the file is missing or unreadable, so a fresh
    /// checkout without the data file still boots with sane behavior.
    pub fn from_env(llm: Arc<dyn LlmClient>, phrases_path: &str) -> Self {
        match std::fs::read_to_string(phrases_path) {
            Ok(contents) => {
                let phrases: Vec<String> = contents
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string)
                    .collect();
                if phrases.is_empty() {
                    tracing::warn!(path = phrases_path, "escalation phrase file empty, using defaults");
                    Self::new(llm)
                } else {
                    tracing::info!(path = phrases_path, count = phrases.len(), "loaded escalation phrases");
                    Self::with_escalation_phrases(llm, phrases)
                }
            }
            Err(e) => {
                tracing::warn!(path = phrases_path, error = %e, "escalation phrase file unreadable, using defaults");
                Self::new(llm)
            }
        }
    }

    fn escalation_precheck(&self, utterance: &str) -> bool {
        let lowered = utterance.to_lowercase();
        self.escalation_phrases.iter().any(|phrase| lowered.contains(phrase.as_str()))
    }

    pub async fn classify(
        &self,
        utterance: &str,
        recent_history: &[Message],
    ) -> EngineResult<Classification> {
        if self.escalation_precheck(utterance) {
            return Ok(Classification {
                intent: Intent::EscalationRequest,
                entities: Entities::default(),
                confidence: 1.0,
                needs_refinement: false,
            });
        }

        let mut prompt = String::from(
            "Classify the customer's latest message into exactly one intent and extract entities.\n\nRecent conversation:\n",
        );
        for msg in recent_history.iter().rev().take(5).collect::<Vec<_>>().into_iter().rev() {
            prompt.push_str(&format!("{}: {}\n", msg.role.as_str(), msg.content));
        }
        prompt.push_str(&format!("user: {utterance}\n"));

        let completion = self
            .llm
            .complete(&prompt, CompletionMode::JsonSchema(schema()), ModelTier::Standard)
            .await?;

        self.parse_completion(completion)
    }

    fn parse_completion(&self, completion: Completion) -> EngineResult<Classification> {
        let value = completion
            .into_structured()
            .ok_or_else(|| EngineError::invariant("intent classifier did not receive structured output"))?;

        let intent_str = value
            .get("intent")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::invariant("classifier response missing intent"))?;
        let mut intent = Intent::from_str(intent_str)
            .ok_or_else(|| EngineError::invariant(format!("unknown intent {intent_str}")))?;

        let confidence = value.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
        let entities: Entities = value
            .get("entities")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| EngineError::invariant(format!("bad entities payload: {e}")))?
            .unwrap_or_default();

        let mut needs_refinement = false;
        if confidence < CONFIDENCE_FLOOR {
            intent = Intent::Unsupported;
            needs_refinement = true;
        }

        Ok(Classification {
            intent,
            entities,
            confidence,
            needs_refinement,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llmclient::fake::FakeLlmClient;

    fn classifier_with(structured: Value) -> IntentClassifier {
        IntentClassifier::new(Arc::new(FakeLlmClient {
            structured,
            text: String::new(),
        }))
    }

    #[tokio::test]
    async fn escalation_phrase_short_circuits_without_llm() {
        let classifier = classifier_with(json!({}));
        let result = classifier
            .classify("quiero hablar con una persona", &[])
            .await
            .unwrap();
        assert_eq!(result.intent, Intent::EscalationRequest);
        assert_eq!(result.confidence, 1.0);
    }

    #[tokio::test]
    async fn low_confidence_coerces_to_unsupported() {
        let classifier = classifier_with(json!({
            "intent": "product_search",
            "entities": {
                "order_number": null, "email": null, "phone": null,
                "brand": null, "category": null, "technical_specs": {}
            },
            "confidence": 0.2
        }));
        let result = classifier.classify("algo raro", &[]).await.unwrap();
        assert_eq!(result.intent, Intent::Unsupported);
        assert!(result.needs_refinement);
    }

    #[tokio::test]
    async fn confident_classification_passes_through() {
        let classifier = classifier_with(json!({
            "intent": "order_inquiry",
            "entities": {
                "order_number": "ORD-123", "email": "a@b.com", "phone": null,
                "brand": null, "category": null, "technical_specs": {}
            },
            "confidence": 0.92
        }));
        let result = classifier.classify("donde esta mi pedido ORD-123", &[]).await.unwrap();
        assert_eq!(result.intent, Intent::OrderInquiry);
        assert_eq!(result.entities.order_number.as_deref(), Some("ORD-123"));
    }
}
