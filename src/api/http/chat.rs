// src/api/http/chat.rs
// POST /api/chat: the non-realtime counterpart to the WebSocket gateway, for
// callers that don't want to hold a socket open. Goes through the same
// session lifecycle (C12) and orchestrator (C11) as `/ws/chat/{client_id}`.

use axum::{extract::State, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::EngineResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub platform: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message_id: String,
    pub text: String,
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> EngineResult<Json<ChatResponse>> {
    let now = Utc::now();
    let (conversation, _outcome) = state
        .sessions
        .begin_or_resume(&req.user_id, &req.platform, &req.user_id, now, state.idle_threshold())
        .await?;

    let reply = state.orchestrator.submit_turn(&conversation.id, req.text).await?;

    let message_id = state
        .sessions
        .recent_messages(&conversation.id, 1)
        .await?
        .into_iter()
        .find(|m| m.role == crate::session::types::MessageRole::Assistant)
        .map(|m| m.message_id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    state.sessions.mark_delivered(&req.user_id, &req.platform, Utc::now()).await?;

    Ok(Json(ChatResponse {
        message_id,
        text: reply.text,
    }))
}
