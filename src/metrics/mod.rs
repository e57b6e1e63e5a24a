// src/metrics/mod.rs
// Prometheus metrics for the storefront engine.

use axum::{http::StatusCode, response::IntoResponse};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::info;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

pub fn init_metrics() {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    PROMETHEUS_HANDLE
        .set(handle)
        .expect("Prometheus handle already initialized");

    info!("Prometheus metrics initialized");
}

/// GET /metrics
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics not initialized".to_string(),
        ),
    }
}

pub fn record_turn(intent: &str, decision_kind: &str) {
    counter!("engine_turns_total", "intent" => intent.to_string(), "decision" => decision_kind.to_string())
        .increment(1);
}

pub fn record_turn_latency(seconds: f64) {
    histogram!("engine_turn_latency_seconds").record(seconds);
}

pub fn record_retrieval(vector_ms: f64, text_ms: f64, total_ms: f64) {
    histogram!("engine_retrieval_vector_latency_ms").record(vector_ms);
    histogram!("engine_retrieval_text_latency_ms").record(text_ms);
    histogram!("engine_retrieval_total_latency_ms").record(total_ms);
}

pub fn record_embedding_batch(batch_size: u64) {
    histogram!("engine_embedding_batch_size").record(batch_size as f64);
}

pub fn record_llm_call(tier: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("engine_llm_calls_total", "tier" => tier.to_string(), "status" => status).increment(1);
}

pub fn connection_opened() {
    let count = ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst) + 1;
    gauge!("engine_active_ws_connections").set(count as f64);
}

pub fn connection_closed() {
    let count = ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
    gauge!("engine_active_ws_connections").set(count as f64);
}

pub fn record_sync_reconcile(kind: &str, upserted: u64, deleted: u64, unchanged: u64) {
    counter!("engine_sync_upserted_total", "kind" => kind.to_string()).increment(upserted);
    counter!("engine_sync_deleted_total", "kind" => kind.to_string()).increment(deleted);
    counter!("engine_sync_unchanged_total", "kind" => kind.to_string()).increment(unchanged);
}

pub fn set_pending_queue_depth(depth: u64) {
    gauge!("engine_pending_queue_depth").set(depth as f64);
}

pub fn record_aggregate_task(bucket_kind: &str, duration_seconds: f64) {
    counter!("engine_aggregate_runs_total", "bucket" => bucket_kind.to_string()).increment(1);
    histogram!("engine_aggregate_duration_seconds", "bucket" => bucket_kind.to_string())
        .record(duration_seconds);
}

pub fn record_retention_deletions(messages: u64, conversations: u64, events: u64) {
    counter!("engine_retention_deleted_total", "entity" => "message").increment(messages);
    counter!("engine_retention_deleted_total", "entity" => "conversation").increment(conversations);
    counter!("engine_retention_deleted_total", "entity" => "event").increment(events);
}

/// Helper for timing one orchestrator turn.
pub struct TurnTimer {
    start: Instant,
}

impl TurnTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn finish(self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        record_turn_latency(elapsed);
        elapsed
    }
}
