// src/api/http/webhook.rs
// POST /webhooks/catalog: the messaging-provider push path for catalog
// mutations. Verified by HMAC-SHA256 over the raw body against the shared
// secret, then handed to the Sync Engine's durable queue (C5) and returned
// within 200 ms; the drain worker does the actual upsert/delete later.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;

use crate::config::CONFIG;
use crate::domain::RecordKind;
use crate::sync::ChangeOp;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct CatalogWebhookPayload {
    kind: RecordKind,
    op: WebhookOp,
    id: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WebhookOp {
    Upsert,
    Delete,
}

impl From<WebhookOp> for ChangeOp {
    fn from(op: WebhookOp) -> Self {
        match op {
            WebhookOp::Upsert => ChangeOp::Upsert,
            WebhookOp::Delete => ChangeOp::Delete,
        }
    }
}

fn verify_signature(headers: &HeaderMap, body: &Bytes) -> Result<(), &'static str> {
    let secret = &CONFIG.webhook.shared_secret;
    if secret.is_empty() {
        return Err("webhook signing secret is not configured");
    }

    let sig_header = headers
        .get("x-catalog-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or("missing X-Catalog-Signature-256 header")?;
    let sig_hex = sig_header.strip_prefix("sha256=").unwrap_or(sig_header);
    let expected = hex::decode(sig_hex).map_err(|_| "signature header is not valid hex")?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| "invalid signing key length")?;
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| "signature mismatch")
}

pub async fn catalog_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    if let Err(msg) = verify_signature(&headers, &body) {
        return Err((StatusCode::UNAUTHORIZED, msg.to_string()));
    }

    let parsed: CatalogWebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid webhook body: {e}")))?;

    let payload_str = parsed.payload.as_ref().map(|v| v.to_string());
    state
        .sync_engine
        .enqueue_durable(
            &state.pool,
            parsed.kind,
            &parsed.id,
            parsed.op.into(),
            payload_str.as_deref(),
        )
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(StatusCode::ACCEPTED)
}
