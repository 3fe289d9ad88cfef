//! WebAPI - Status endpoints
//!
//! ## Responsibilities
//!
//! - Liveness with the active session count
//! - Recent session reports for operators

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: i64,
    pub active_sessions: usize,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: (Utc::now() - state.started_at).num_seconds(),
        active_sessions: state.registry.active_count(),
    })
}
