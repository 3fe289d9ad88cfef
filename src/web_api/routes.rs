//! API Routes

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::ApiResponse;
use crate::state::AppState;
use crate::verdict_log::SessionReport;

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 500;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(super::health_check))
        // Sessions
        .route("/api/sessions", get(list_sessions))
        .with_state(state)
}

// ========================================
// Session Handlers
// ========================================

#[derive(Deserialize)]
struct SessionQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct SessionOverview {
    active_sessions: usize,
    total_started: u64,
    recent: Vec<SessionReport>,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if limit == 0 || limit > MAX_LIMIT {
        return Err(Error::Validation(format!(
            "limit must be within 1..={}",
            MAX_LIMIT
        )));
    }

    let overview = SessionOverview {
        active_sessions: state.registry.active_count(),
        total_started: state.registry.total_started(),
        recent: state.verdicts.latest(limit).await,
    };

    Ok(Json(ApiResponse::success(overview)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_registry::SessionRegistry;
    use crate::state::AppConfig;
    use crate::verdict_log::VerdictLog;
    use crate::verification_session::SessionMode;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state() -> AppState {
        AppState {
            config: Arc::new(AppConfig::default()),
            registry: SessionRegistry::new(),
            verdicts: Arc::new(VerdictLog::new(10)),
            started_at: Utc::now(),
        }
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_active_sessions() {
        let state = state();
        let _guard = state.registry.register("alert_a");

        let (status, body) = get_json(create_router(state.clone()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_sessions"], 1);
    }

    #[tokio::test]
    async fn test_sessions_lists_recent_reports() {
        let state = state();
        state
            .verdicts
            .record(SessionReport {
                session_id: "alert_2025-04-20_14-03-11".to_string(),
                mode: SessionMode::Verification,
                started_at: Utc::now(),
                finished_at: Utc::now(),
                images_captured: 8,
                images_with_hazard: 2,
                detection_ratio: Some(0.25),
                original_flag: true,
                verdict: Some(true),
                published: true,
            })
            .await;

        let (status, body) = get_json(create_router(state), "/api/sessions?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["data"]["active_sessions"], 0);
        assert_eq!(body["data"]["recent"][0]["mode"], "verification");
        assert_eq!(body["data"]["recent"][0]["images_with_hazard"], 2);
    }

    #[tokio::test]
    async fn test_sessions_rejects_bad_limit() {
        let (status, body) = get_json(create_router(state()), "/api/sessions?limit=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "VALIDATION_ERROR");
    }
}
