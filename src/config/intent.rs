// src/config/intent.rs
// Intent Classifier (C8) tuning: where to find the escalation phrase list.
// Per spec.md §9, the phrase list is configurable data, not code — this
// points at a plain-text file (one phrase per line) rather than embedding
// the phrases as Rust constants.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentConfig {
    /// Path to a newline-delimited phrase list. Missing file falls back to
    /// the built-in defaults in `intent::DEFAULT_ESCALATION_PHRASES`.
    pub escalation_phrases_path: String,
}

impl IntentConfig {
    pub fn from_env() -> Self {
        Self {
            escalation_phrases_path: super::helpers::env_or(
                "ESCALATION_PHRASES_PATH",
                "config/escalation_phrases.txt",
            ),
        }
    }
}
