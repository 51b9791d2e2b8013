//! Request handlers.

pub mod ai;
pub mod events;
pub mod incidents;

use axum::extract::State;
use axum::Json;
use serde_json::json;

use crate::AppState;

/// Liveness and load snapshot.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let queue = state.queue.telemetry();
    let hub = state.hub.metrics_snapshot();
    let breaker = state.ai.breaker_status();
    Json(json!({
        "status": "ok",
        "queue": queue,
        "broadcast": hub,
        "breaker": breaker.state,
        "aiAvailable": state.ai.available(),
    }))
}
