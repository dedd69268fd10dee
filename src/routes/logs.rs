//! Log buffer read endpoint for the web UI.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/logs` — snapshot of the in-memory log ring buffer.
///
/// Returns `{"logs": [...], "count": N}`, oldest entry first. Unauthenticated;
/// CORS is opened by the router layer so a locally served viewer can read it.
pub async fn get_logs(State(state): State<AppState>) -> Json<Value> {
    let logs = state.log.snapshot().await;
    Json(json!({
        "count": logs.len(),
        "logs": logs,
    }))
}
