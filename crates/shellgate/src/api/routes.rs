use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderValue, Method};
use axum::routing::{any, get};
use chrono::Utc;
use log::warn;
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::ratelimit::RateLimiterStats;
use crate::session::AlertsSnapshot;
use crate::ws::handler::ws_handler;

use super::AppState;

/// Build the application router: the WebSocket endpoint plus the
/// operational sidecars, behind CORS and request tracing.
pub fn build_router(state: AppState, allowed_origins: &[String]) -> Router {
    let cors = cors_layer(allowed_origins);

    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/ws", any(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(Any);
    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("ignoring unparseable CORS origin: {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub sessions: SessionStats,
    pub rate_limiting: RateLimiterStats,
    pub alerts: AlertsSnapshot,
    pub uptime_secs: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub active: usize,
    pub limit: usize,
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let controller = &state.controller;
    Json(StatsResponse {
        sessions: SessionStats {
            active: controller.registry.len(),
            limit: controller.settings.max_sessions,
        },
        rate_limiting: controller.limiter.stats(),
        alerts: controller.alerts.snapshot(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}
