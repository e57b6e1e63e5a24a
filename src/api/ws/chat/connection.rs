// src/api/ws/chat/connection.rs
// A thin wrapper around the WebSocket sender half: serializes outbound
// frames, tracks whether the socket has been closed so late sends from a
// concurrent turn are dropped instead of erroring, and runs the heartbeat.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::heartbeat::{HeartbeatManager, StatusSender};
use crate::api::ws::message::WsServerMessage;

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(25);

struct PingSender {
    sender: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    is_closed: Arc<Mutex<bool>>,
}

impl StatusSender for PingSender {
    fn send_status(&self, _message: &str) {
        let sender = self.sender.clone();
        let is_closed = self.is_closed.clone();
        tokio::spawn(async move {
            if *is_closed.lock().await {
                return;
            }
            if let Err(e) = sender.lock().await.send(Message::Ping(Vec::new().into())).await {
                warn!("heartbeat ping failed (socket likely closed): {}", e);
            }
        });
    }
}

pub struct WebSocketConnection {
    sender: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    is_closed: Arc<Mutex<bool>>,
    last_activity: Mutex<Instant>,
    heartbeat: Arc<HeartbeatManager<PingSender>>,
}

impl WebSocketConnection {
    pub fn new(sender: SplitSink<WebSocket, Message>) -> Self {
        let sender = Arc::new(Mutex::new(sender));
        let is_closed = Arc::new(Mutex::new(false));
        let heartbeat = Arc::new(HeartbeatManager::new(Arc::new(PingSender {
            sender: sender.clone(),
            is_closed: is_closed.clone(),
        })));
        heartbeat.start(HEARTBEAT_PERIOD);

        Self {
            sender,
            is_closed,
            last_activity: Mutex::new(Instant::now()),
            heartbeat,
        }
    }

    pub async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_activity.lock().await.elapsed()
    }

    pub async fn mark_closed(&self) {
        *self.is_closed.lock().await = true;
        self.heartbeat.stop();
    }

    pub async fn is_closed(&self) -> bool {
        *self.is_closed.lock().await
    }

    /// Sends one server frame, flushing immediately. Silently drops the send
    /// on an already-closed connection; callers persist first so a dropped
    /// send never loses data, only the live push.
    pub async fn send(&self, msg: &WsServerMessage) -> Result<()> {
        if self.is_closed().await {
            debug!("skipping send on closed connection");
            return Ok(());
        }
        let text = serde_json::to_string(msg)?;
        let mut sender = self.sender.lock().await;
        sender.send(Message::Text(Utf8Bytes::from(text))).await?;
        sender.flush().await?;
        Ok(())
    }

    pub async fn send_pong(&self) -> Result<()> {
        if self.is_closed().await {
            return Ok(());
        }
        let mut sender = self.sender.lock().await;
        sender.send(Message::Pong(Vec::new().into())).await?;
        Ok(())
    }
}
