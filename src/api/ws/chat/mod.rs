// src/api/ws/chat/mod.rs
// Realtime Gateway (C14), WebSocket leg: `/ws/chat/{client_id}`. Binds the
// socket to a (user_id, platform) session via C12, dispatches inbound
// `user_message` frames to the Conversation Orchestrator (C11), and
// redelivers anything sent while the socket was closed.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    response::IntoResponse,
};
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};

pub mod connection;
pub mod heartbeat;

pub use connection::WebSocketConnection;

use crate::api::ws::message::{WsClientMessage, WsServerMessage};
use crate::auth::verify_token;
use crate::metrics;
use crate::session::types::MessageRole;
use crate::state::AppState;

const REDELIVER_LIMIT: i64 = 50;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
    #[serde(default = "default_platform")]
    platform: String,
}

fn default_platform() -> String {
    "web".to_string()
}

pub async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(app_state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_id = query
        .token
        .as_deref()
        .and_then(|token| verify_token(token).ok())
        .map(|claims| claims.sub)
        .unwrap_or_else(|| client_id.clone());
    let platform = query.platform;

    ws.on_upgrade(move |socket| handle_socket(socket, app_state, client_id, user_id, platform))
}

async fn handle_socket(
    socket: WebSocket,
    app_state: Arc<AppState>,
    client_id: String,
    user_id: String,
    platform: String,
) {
    metrics::connection_opened();
    let (sender, mut receiver) = socket.split();
    let connection = Arc::new(WebSocketConnection::new(sender));

    let now = Utc::now();
    let conversation = match app_state
        .sessions
        .begin_or_resume(&user_id, &platform, &client_id, now, app_state.idle_threshold())
        .await
    {
        Ok((conv, _outcome)) => conv,
        Err(e) => {
            warn!(error = %e, "failed to open session for websocket connection");
            let _ = connection
                .send(&WsServerMessage::Error {
                    code: "session_unavailable".to_string(),
                    text: "couldn't start your session, please try again".to_string(),
                })
                .await;
            connection.mark_closed().await;
            metrics::connection_closed();
            return;
        }
    };
    info!(conversation_id = %conversation.id, user_id, platform, "websocket connected");

    redeliver_pending(&app_state, &connection, &conversation.id, &user_id, &platform).await;

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                connection.touch().await;
                match serde_json::from_str::<WsClientMessage>(&text) {
                    Ok(WsClientMessage::UserMessage { text, .. }) => {
                        handle_user_message(&app_state, &connection, &conversation.id, &user_id, &platform, text)
                            .await;
                    }
                    Ok(WsClientMessage::Ping) => {
                        let _ = connection.send_pong().await;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to parse inbound websocket frame");
                        let _ = connection
                            .send(&WsServerMessage::Error {
                                code: "bad_frame".to_string(),
                                text: "couldn't understand that message".to_string(),
                            })
                            .await;
                    }
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                connection.touch().await;
            }
            Ok(Message::Close(_)) => {
                info!(conversation_id = %conversation.id, "client closed websocket");
                break;
            }
            Ok(Message::Binary(_)) => {}
            Err(e) => {
                warn!(error = %e, "websocket error");
                break;
            }
        }
    }

    connection.mark_closed().await;
    metrics::connection_closed();
    info!(conversation_id = %conversation.id, "websocket disconnected");
}

async fn handle_user_message(
    app_state: &Arc<AppState>,
    connection: &Arc<WebSocketConnection>,
    conversation_id: &str,
    user_id: &str,
    platform: &str,
    text: String,
) {
    let reply = match app_state.orchestrator.submit_turn(conversation_id, text).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(conversation_id, error = %e, "turn processing failed");
            let _ = connection
                .send(&WsServerMessage::Error {
                    code: "busy".to_string(),
                    text: "we're busy right now, please try again in a moment".to_string(),
                })
                .await;
            return;
        }
    };

    // The orchestrator already persisted the bot message durably before
    // returning; fetch that row so the delivered frame's message_id matches
    // what a reconnect would redeliver.
    let last_bot = app_state
        .sessions
        .recent_messages(conversation_id, 1)
        .await
        .unwrap_or_default()
        .into_iter()
        .find(|m| m.role == MessageRole::Assistant);

    let (message_id, created_at) = match last_bot {
        Some(m) => (m.message_id, m.created_at),
        None => (uuid::Uuid::new_v4().to_string(), Utc::now()),
    };

    let _ = connection
        .send(&WsServerMessage::AgentResponse {
            message_id,
            text: reply.text,
            created_at,
        })
        .await;

    let _ = app_state.sessions.mark_delivered(user_id, platform, Utc::now()).await;
}

async fn redeliver_pending(
    app_state: &Arc<AppState>,
    connection: &Arc<WebSocketConnection>,
    conversation_id: &str,
    user_id: &str,
    platform: &str,
) {
    let since = app_state.sessions.last_delivered_at(user_id, platform).await.unwrap_or(None);
    let pending = app_state
        .sessions
        .undelivered_messages(conversation_id, since, REDELIVER_LIMIT)
        .await
        .unwrap_or_default();

    let mut delivered_any = false;
    for message in pending.into_iter().filter(|m| m.role == MessageRole::Assistant) {
        if connection
            .send(&WsServerMessage::AgentResponse {
                message_id: message.message_id,
                text: message.content,
                created_at: message.created_at,
            })
            .await
            .is_ok()
        {
            delivered_any = true;
        }
    }
    if delivered_any {
        let _ = app_state.sessions.mark_delivered(user_id, platform, Utc::now()).await;
    }
}
