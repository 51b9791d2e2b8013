//! AI summarization admin handlers.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use pulse_ai::BreakerStatus;
use pulse_core::Incident;

use crate::error::ApiResult;
use crate::AppState;

/// `POST /ai/summarize/:id` — manual trigger, breaker still honored.
/// 503 when the breaker is open or no API key is configured.
pub async fn summarize_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Incident>> {
    let incident = state.summarizer.summarize_one(id).await?;
    Ok(Json(incident))
}

/// `GET /ai/circuit-breaker` — state plus the last ten transitions.
pub async fn breaker_status(State(state): State<AppState>) -> Json<BreakerStatus> {
    Json(state.ai.breaker_status())
}

/// `POST /ai/circuit-breaker/reset` — force the breaker closed.
pub async fn breaker_reset(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.ai.reset_breaker();
    tracing::info!(subsystem = "api", "circuit breaker manually reset");
    Json(json!({
        "status": "reset",
        "breaker": state.ai.breaker_status(),
    }))
}
