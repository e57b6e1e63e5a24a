// src/config/session.rs
// Conversation lifecycle tuning (C11, C12, C13)

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// A conversation with no turns for this long is considered idle and is
    /// eligible to be closed by the orchestrator.
    pub idle_threshold_secs: u64,
    /// Max refinement turns (`n`) before the Result Validator is forced to
    /// answer or escalate instead of asking another clarifying question.
    pub max_refine_turns: i64,
    /// WebSocket heartbeat interval.
    pub heartbeat_interval_secs: u64,
    /// How long message rows are retained before the retention task deletes them.
    /// Aggregates in metrics_hourly/metrics_daily are never deleted.
    pub message_retention_days: i64,
    /// How long ended/abandoned conversation rows (and their messages) are retained.
    pub conversation_retention_days: i64,
    /// How long non-critical events (e.g. dropped-turn system notes) are retained.
    pub event_retention_days: i64,
    /// Max redelivered messages on reconnect.
    pub max_redelivery_count: i64,
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self {
            idle_threshold_secs: super::helpers::env_usize("SESSION_IDLE_THRESHOLD_SECS", 1800) as u64,
            max_refine_turns: super::helpers::env_usize("SESSION_MAX_REFINE_TURNS", 2) as i64,
            heartbeat_interval_secs: super::helpers::env_usize("SESSION_HEARTBEAT_INTERVAL_SECS", 25) as u64,
            message_retention_days: super::helpers::env_usize("MESSAGE_RETENTION_DAYS", 7) as i64,
            conversation_retention_days: super::helpers::env_usize("CONVERSATION_RETENTION_DAYS", 30) as i64,
            event_retention_days: super::helpers::env_usize("EVENT_RETENTION_DAYS", 90) as i64,
            max_redelivery_count: super::helpers::env_usize("SESSION_MAX_REDELIVERY_COUNT", 50) as i64,
        }
    }
}
