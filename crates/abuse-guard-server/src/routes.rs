//! Route configuration and handlers.

use std::sync::Arc;

use abuse_guard::{AbuseDetector, DetectorStats, abuse_guard_middleware};
use axum::Json;
use axum::extract::State;
use axum::middleware::from_fn_with_state;
use axum::routing::{Router, get};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

/// Create the router with every route behind the abuse guard.
pub fn create_router(detector: Arc<AbuseDetector>) -> Router {
    let api_routes = Router::new()
        .route("/ping", get(ping))
        .route("/guard/stats", get(guard_stats));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes)
        .with_state(detector.clone())
        .layer(from_fn_with_state(detector, abuse_guard_middleware))
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ping() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}

async fn guard_stats(State(detector): State<Arc<AbuseDetector>>) -> Json<DetectorStats> {
    Json(detector.stats())
}
