// src/session/types.rs
// Conversation/Message/SessionPointer types shared across the Session Store,
// orchestrator, and realtime gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// Open and within the idle window.
    Active,
    /// Closed explicitly or after idling out with at least one exchange.
    Ended,
    /// Idled out with only a user message and no bot reply.
    Abandoned,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Ended => "ended",
            ConversationStatus::Abandoned => "abandoned",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ConversationStatus::Active),
            "ended" => Some(ConversationStatus::Ended),
            "abandoned" => Some(ConversationStatus::Abandoned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "bot",
            MessageRole::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "bot" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub platform: String,
    pub status: ConversationStatus,
    pub refine_count: i64,
    pub messages_count: i64,
    pub user_messages_count: i64,
    pub bot_messages_count: i64,
    pub avg_response_time_ms: f64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub intent: Option<String>,
    pub entities: Option<serde_json::Value>,
    pub confidence: Option<f64>,
    pub response_time_ms: Option<f64>,
    pub tools_used: Option<serde_json::Value>,
    pub decision_kind: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// What `begin_or_resume` returns: either the caller picked up an existing
/// active conversation within the idle window, or a fresh one was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed,
    Created,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub platform: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<ConversationStatus>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Page {
    pub fn first(limit: i64) -> Self {
        Self { offset: 0, limit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_status_round_trips() {
        assert_eq!(
            ConversationStatus::from_str(ConversationStatus::Abandoned.as_str()),
            Some(ConversationStatus::Abandoned)
        );
    }

    #[test]
    fn message_role_round_trips() {
        assert_eq!(
            MessageRole::from_str(MessageRole::Assistant.as_str()),
            Some(MessageRole::Assistant)
        );
    }
}
