//! # pulse-api
//!
//! HTTP and WebSocket surface for the pulse incident pipeline: event
//! ingestion with the admission gate, event/incident queries, AI
//! summarization admin, and the real-time broadcast endpoint.

pub mod admission;
pub mod error;
pub mod handlers;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use pulse_ai::AiClient;
use pulse_core::{BroadcastHub, EventRepository, IncidentRepository};
use pulse_workers::{EventQueue, SummarizationWorker};

use admission::SlidingWindowLimiter;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub events: Arc<dyn EventRepository>,
    pub incidents: Arc<dyn IncidentRepository>,
    pub queue: Arc<EventQueue>,
    pub hub: Arc<BroadcastHub>,
    pub ai: Arc<AiClient>,
    pub summarizer: Arc<SummarizationWorker>,
    pub limiter: Arc<SlidingWindowLimiter>,
}

/// Build the API router over the given state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/events",
            post(handlers::events::create_event).get(handlers::events::list_events),
        )
        .route("/events/stats", get(handlers::events::event_stats))
        .route("/events/:id", get(handlers::events::get_event))
        .route("/incidents", get(handlers::incidents::list_incidents))
        .route("/incidents/active", get(handlers::incidents::active_incidents))
        .route(
            "/incidents/:id",
            get(handlers::incidents::get_incident).patch(handlers::incidents::patch_incident),
        )
        .route("/ai/summarize/:id", post(handlers::ai::summarize_incident))
        .route("/ai/circuit-breaker", get(handlers::ai::breaker_status))
        .route("/ai/circuit-breaker/reset", post(handlers::ai::breaker_reset))
        .route("/health", get(handlers::health))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}
