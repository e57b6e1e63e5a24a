// src/api/http/health.rs
// GET /health: reports database connectivity plus a cheap reachability probe
// for each external collaborator. "degraded" means the database is fine but
// at least one upstream isn't; "unhealthy" means the database itself is down.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Serialize)]
struct Services {
    database: &'static str,
    embeddings: &'static str,
    llm: &'static str,
    catalog: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    services: Services,
}

fn ok_or_error(ok: bool) -> &'static str {
    if ok { "ok" } else { "error" }
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database_ok = sqlx::query("SELECT 1").fetch_one(&state.pool).await.is_ok();
    let (embeddings_ok, llm_ok, catalog_ok) = tokio::join!(
        state.embeddings.health_check(),
        state.llm.health_check(),
        state.catalog.health_check(),
    );

    let status = if !database_ok {
        "unhealthy"
    } else if !embeddings_ok || !llm_ok || !catalog_ok {
        "degraded"
    } else {
        "healthy"
    };

    let response = HealthResponse {
        status,
        services: Services {
            database: ok_or_error(database_ok),
            embeddings: ok_or_error(embeddings_ok),
            llm: ok_or_error(llm_ok),
            catalog: ok_or_error(catalog_ok),
        },
    };

    let code = if status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(response))
}
