// src/api/ws/message.rs
// Wire frames for the WebSocket chat transport (C14). Deliberately small:
// the gateway only ever needs to move one user utterance in and one bot
// reply (plus system notes and errors) out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frames a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    UserMessage {
        text: String,
        #[serde(default)]
        client_msg_id: Option<String>,
    },
    Ping,
}

/// Frames the server may send.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    AgentResponse {
        message_id: String,
        text: String,
        created_at: DateTime<Utc>,
    },
    System {
        text: String,
    },
    Error {
        code: String,
        text: String,
    },
}
