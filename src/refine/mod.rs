// src/refine/mod.rs
// Refinement Agent (C10): picks the attribute with the highest entropy among
// a 2-8 distinct-value band and produces one clarifying question.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::llmclient::{CompletionMode, LlmClient, ModelTier};
use crate::retrieval::RetrievedRecord;

/// Fixed tie-break order per spec 4.10 step 2.
const ATTRIBUTE_PRIORITY: &[&str] = &["brand", "amperage", "voltage", "polos", "curve", "category"];

#[derive(Debug, Clone)]
pub struct RefinementQuestion {
    pub question: String,
    pub attribute: Option<String>,
    pub options: Vec<String>,
    pub needs_refinement: bool,
}

pub struct RefinementAgent {
    llm: Arc<dyn LlmClient>,
}

impl RefinementAgent {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn attribute_value(record: &RetrievedRecord, key: &str) -> Option<String> {
        if key == "brand" {
            return record.record.brand.clone();
        }
        record.record.attribute_str(key)
    }

    /// Distinct-value counts per candidate attribute, in the fixed priority
    /// order, skipping attributes with fewer than 2 or more than 8 values.
    fn candidate_attributes(results: &[RetrievedRecord]) -> Vec<(&'static str, HashMap<String, usize>)> {
        let mut candidates = Vec::new();
        for &attr in ATTRIBUTE_PRIORITY {
            let mut counts: HashMap<String, usize> = HashMap::new();
            for record in results {
                if let Some(value) = Self::attribute_value(record, attr) {
                    *counts.entry(value).or_insert(0) += 1;
                }
            }
            if counts.len() >= 2 && counts.len() <= 8 {
                candidates.push((attr, counts));
            }
        }
        candidates
    }

    fn entropy(counts: &HashMap<String, usize>) -> f64 {
        let total: usize = counts.values().sum();
        if total == 0 {
            return 0.0;
        }
        counts
            .values()
            .map(|&c| {
                let p = c as f64 / total as f64;
                if p > 0.0 {
                    -p * p.log2()
                } else {
                    0.0
                }
            })
            .sum()
    }

    /// Selects the attribute per step 2 and composes the question per step 3.
    /// Falls back to the generic prompt (step 4) when nothing qualifies.
    pub async fn ask(&self, results: &[RetrievedRecord]) -> RefinementQuestion {
        let candidates = Self::candidate_attributes(results);

        // `candidates` is already in fixed priority order (brand first); a
        // plain `max_by` would keep the *last* equally-scored entry, which
        // would let `category` beat `brand` on a tie. Walk forward and only
        // replace the running best on a strict improvement so the earliest
        // (highest-priority) attribute wins ties, per spec step 2.
        let mut chosen: Option<&(&'static str, HashMap<String, usize>)> = None;
        for candidate in &candidates {
            let better = match chosen {
                None => true,
                Some(best) => Self::entropy(&candidate.1) > Self::entropy(&best.1),
            };
            if better {
                chosen = Some(candidate);
            }
        }

        let Some((attribute, counts)) = chosen else {
            return RefinementQuestion {
                question: "¿Podrías describir con más detalle lo que necesitas?".to_string(),
                attribute: None,
                options: Vec::new(),
                needs_refinement: true,
            };
        };

        let mut options: Vec<String> = counts.keys().cloned().collect();
        options.sort();

        let phrasing_prompt = format!(
            "Write one short, friendly clarifying question in Spanish asking the customer to pick a {attribute} among these options: {}. Do not invent options.",
            options.join(", ")
        );

        let question = match self
            .llm
            .complete(&phrasing_prompt, CompletionMode::Free, ModelTier::Cheap)
            .await
        {
            Ok(completion) => completion
                .as_text()
                .map(str::to_string)
                .unwrap_or_else(|| Self::fallback_phrasing(attribute, &options)),
            Err(_) => Self::fallback_phrasing(attribute, &options),
        };

        RefinementQuestion {
            question,
            attribute: Some(attribute.to_string()),
            options,
            needs_refinement: true,
        }
    }

    fn fallback_phrasing(attribute: &str, options: &[String]) -> String {
        format!("¿Cuál {attribute} prefieres? Opciones: {}", options.join(", "))
    }
}

/// Attribute-frequency table used by the synthesis step when a final answer
/// is produced instead of a refinement question (kept here since it shares
/// the same grouping logic).
pub fn attribute_frequency(results: &[RetrievedRecord], key: &str) -> BTreeMap<String, usize> {
    let mut out = BTreeMap::new();
    for record in results {
        if let Some(value) = RefinementAgent::attribute_value(record, key) {
            *out.entry(value).or_insert(0) += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Record, RecordKind};
    use crate::llmclient::fake::FakeLlmClient;
    use crate::retrieval::ScoreComponents;

    fn record_with_brand(id: &str, brand: &str) -> RetrievedRecord {
        RetrievedRecord {
            record: Record {
                id: id.to_string(),
                kind: RecordKind::Product,
                title: "t".to_string(),
                body: "b".to_string(),
                url: None,
                brand: Some(brand.to_string()),
                attributes: Default::default(),
                content_hash: String::new(),
                dense_vector: None,
                lexical_text: String::new(),
                active: true,
                updated_at: chrono::Utc::now(),
                source_version: None,
            },
            score: 0.5,
            components: ScoreComponents {
                rrf_score: 0.5,
                boost: 0.0,
            },
        }
    }

    #[tokio::test]
    async fn picks_brand_when_it_is_the_only_qualifying_attribute() {
        let agent = RefinementAgent::new(Arc::new(FakeLlmClient {
            structured: serde_json::json!({}),
            text: "¿Qué marca prefieres?".to_string(),
        }));
        let results = vec![
            record_with_brand("p1", "Schneider"),
            record_with_brand("p2", "ABB"),
            record_with_brand("p3", "Schneider"),
        ];
        let question = agent.ask(&results).await;
        assert_eq!(question.attribute.as_deref(), Some("brand"));
        assert!(question.options.contains(&"ABB".to_string()));
        assert!(question.needs_refinement);
    }

    fn record_with_brand_and_amperage(id: &str, brand: &str, amperage: &str) -> RetrievedRecord {
        let mut r = record_with_brand(id, brand);
        r.record
            .attributes
            .insert("amperage".to_string(), serde_json::json!(amperage));
        r
    }

    #[tokio::test]
    async fn ties_in_entropy_break_toward_fixed_priority_order() {
        // brand and amperage both split 2/2 across four records (equal
        // entropy); brand must win because it is earlier in the priority
        // list, even though it's pushed earlier into `candidates` too --
        // this exercises that a naive `max_by` (which keeps the *last*
        // equal-max element) would wrongly prefer amperage.
        let agent = RefinementAgent::new(Arc::new(FakeLlmClient {
            structured: serde_json::json!({}),
            text: "question".to_string(),
        }));
        let results = vec![
            record_with_brand_and_amperage("p1", "Schneider", "16A"),
            record_with_brand_and_amperage("p2", "Schneider", "16A"),
            record_with_brand_and_amperage("p3", "ABB", "20A"),
            record_with_brand_and_amperage("p4", "ABB", "20A"),
        ];
        let question = agent.ask(&results).await;
        assert_eq!(question.attribute.as_deref(), Some("brand"));
    }

    #[tokio::test]
    async fn falls_back_to_generic_question_when_nothing_qualifies() {
        let agent = RefinementAgent::new(Arc::new(FakeLlmClient {
            structured: serde_json::json!({}),
            text: String::new(),
        }));
        let results = vec![record_with_brand("p1", "OnlyBrand")];
        let question = agent.ask(&results).await;
        assert!(question.attribute.is_none());
        assert!(question.needs_refinement);
    }
}
