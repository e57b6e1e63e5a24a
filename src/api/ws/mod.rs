// src/api/ws/mod.rs
// WebSocket transport surface: the chat gateway (C14) and its wire frames.

pub mod chat;
pub mod message;

pub use chat::ws_chat_handler;
