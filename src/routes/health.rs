//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/health` — liveness probe with connection counts.
///
/// No authentication required, suitable for load-balancer health checks and
/// the log-viewer UI's status badge.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let (active_users, active_connections) = state.registry.stats().await;
    Json(json!({
        "status": "healthy",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "active_users": active_users,
        "active_connections": active_connections,
        "pending_requests": state.pending.len(),
        "log_buffer_size": state.log.len().await,
    }))
}
