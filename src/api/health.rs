//! Health check endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use super::{ApiState, ProviderInfo};

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Detailed readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub sessions: SessionCounts,
    pub providers: ProviderInfo,
}

/// Live sessions against the configured limit
#[derive(Serialize)]
pub struct SessionCounts {
    pub active: usize,
    pub capacity: usize,
}

/// Liveness probe - is the service running?
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe - can the service accept another session?
async fn ready(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let active = state.store.len().await;
    let capacity = state.store.capacity();
    let (status, http_status) = if active < capacity {
        ("ok", StatusCode::OK)
    } else {
        ("at_capacity", StatusCode::SERVICE_UNAVAILABLE)
    };

    (
        http_status,
        Json(ReadinessResponse {
            status,
            sessions: SessionCounts { active, capacity },
            providers: state.providers.clone(),
        }),
    )
}

/// Build health router (liveness only, no state needed)
pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

/// Build readiness router
pub fn ready_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health/ready", get(ready))
        .with_state(state)
}
