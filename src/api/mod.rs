// src/api/mod.rs
// API module: HTTP and WebSocket transport for the conversation engine.

pub mod http;
pub mod ws;
