// src/validate/mod.rs
// Result Validator (C9): the decision table that replaces exception-based
// control flow. Pure function of (intent, retrieved set, refine count).

use crate::intent::Intent;
use crate::retrieval::RetrievedRecord;

pub const LOW_SCORE_FLOOR: f64 = 0.3;
pub const HIGH_CONFIDENCE_FLOOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineReason {
    FromQuery,
    FromAttributes,
}

impl RefineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefineReason::FromQuery => "from_query",
            RefineReason::FromAttributes => "from_attributes",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Decision {
    Answer,
    Refine(RefineReason),
    Escalate(&'static str),
}

impl Decision {
    pub fn as_kind_str(&self) -> &'static str {
        match self {
            Decision::Answer => "answer",
            Decision::Refine(_) => "refine",
            Decision::Escalate(_) => "escalate",
        }
    }
}

/// Per spec table:
///
/// | Condition | Decision |
/// |---|---|
/// | escalation_request OR 3 consecutive answer_failed | escalate |
/// | R empty OR top score < 0.3 | n<2 -> refine(from_query); else escalate |
/// | \|R\| > refine_threshold AND n<2 | refine(from_attributes) |
/// | \|R\| <= refine_threshold AND top score >= 0.5 | answer |
/// | otherwise | answer if n>=2 else refine(from_attributes) |
pub fn validate(
    intent: Intent,
    results: &[RetrievedRecord],
    refine_count: i64,
    consecutive_answer_failures: u32,
    max_refine_turns: i64,
    result_count_refine_threshold: usize,
) -> Decision {
    if intent == Intent::EscalationRequest {
        return Decision::Escalate("explicit escalation request");
    }
    if consecutive_answer_failures >= 3 {
        return Decision::Escalate("three consecutive answer failures");
    }

    let top_score = results.first().map(|r| r.score).unwrap_or(0.0);

    if results.is_empty() || top_score < LOW_SCORE_FLOOR {
        return if refine_count < max_refine_turns {
            Decision::Refine(RefineReason::FromQuery)
        } else {
            Decision::Escalate("no confident match after refinement budget exhausted")
        };
    }

    if results.len() > result_count_refine_threshold && refine_count < max_refine_turns {
        return Decision::Refine(RefineReason::FromAttributes);
    }

    if results.len() <= result_count_refine_threshold && top_score >= HIGH_CONFIDENCE_FLOOR {
        return Decision::Answer;
    }

    if refine_count >= max_refine_turns {
        Decision::Answer
    } else {
        Decision::Refine(RefineReason::FromAttributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Record, RecordKind};
    use crate::retrieval::ScoreComponents;

    fn result(score: f64) -> RetrievedRecord {
        RetrievedRecord {
            record: Record {
                id: "p1".to_string(),
                kind: RecordKind::Product,
                title: "t".to_string(),
                body: "b".to_string(),
                url: None,
                brand: None,
                attributes: Default::default(),
                content_hash: String::new(),
                dense_vector: None,
                lexical_text: String::new(),
                active: true,
                updated_at: chrono::Utc::now(),
                source_version: None,
            },
            score,
            components: ScoreComponents {
                rrf_score: score,
                boost: 0.0,
            },
        }
    }

    #[test]
    fn escalation_intent_always_escalates() {
        let decision = validate(Intent::EscalationRequest, &[], 0, 0, 2, 15);
        assert!(matches!(decision, Decision::Escalate(_)));
    }

    #[test]
    fn empty_results_refine_then_escalate() {
        let d1 = validate(Intent::ProductSearch, &[], 0, 0, 2, 15);
        assert!(matches!(d1, Decision::Refine(RefineReason::FromQuery)));

        let d2 = validate(Intent::ProductSearch, &[], 2, 0, 2, 15);
        assert!(matches!(d2, Decision::Escalate(_)));
    }

    #[test]
    fn too_many_results_refines_from_attributes() {
        let results: Vec<_> = (0..20).map(|_| result(0.6)).collect();
        let decision = validate(Intent::ProductSearch, &results, 0, 0, 2, 15);
        assert!(matches!(decision, Decision::Refine(RefineReason::FromAttributes)));
    }

    #[test]
    fn confident_small_result_set_answers() {
        let results = vec![result(0.8), result(0.6)];
        let decision = validate(Intent::ProductSearch, &results, 0, 0, 2, 15);
        assert!(matches!(decision, Decision::Answer));
    }

    #[test]
    fn refine_budget_exhausted_forces_answer() {
        let results = vec![result(0.4)];
        let decision = validate(Intent::ProductSearch, &results, 2, 0, 2, 15);
        assert!(matches!(decision, Decision::Answer));
    }
}
