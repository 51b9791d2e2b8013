//! pulse-api - HTTP server for the pulse incident pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use tower_http::{
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use pulse_ai::AiClient;
use pulse_api::admission::{RateLimitConfig, SlidingWindowLimiter};
use pulse_api::{build_router, AppState};
use pulse_core::{
    defaults, BroadcastHub, EventRepository, IncidentRepository, ScoringConfig, StatsRepository,
};
use pulse_db::Database;
use pulse_workers::{
    start_heartbeat, AggregationConfig, AggregationWorker, EventQueue, QueueConfig, QueueWorker,
    SpikeConfig, SpikeDetector, SummarizationWorker, SummarizeConfig,
};

/// Generates time-ordered UUIDv7 request correlation IDs.
#[derive(Clone, Default)]
struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   `LOG_FORMAT` - "json" or "text" (default: "text")
///   `LOG_FILE`   - path to log file (optional, enables file logging)
///   `RUST_LOG`   - standard env filter
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pulse_api=debug,pulse_workers=debug,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(path) = log_file {
        let file_dir = std::path::Path::new(&path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(&path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("pulse-api.log");
        let appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(non_blocking),
                )
                .init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
        } else {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
        None
    }
}

/// Parse allowed origins from the comma-separated `ALLOWED_ORIGINS`
/// environment variable. Defaults to localhost for development.
fn parse_allowed_origins() -> Vec<HeaderValue> {
    let origins = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string());
    origins
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect()
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing();

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?;
    let db = Database::connect(&database_url).await?;
    db.migrate().await?;

    let events: Arc<dyn EventRepository> = db.events.clone();
    let incidents: Arc<dyn IncidentRepository> = db.incidents.clone();
    let stats: Arc<dyn StatsRepository> = db.stats.clone();

    let hub = Arc::new(BroadcastHub::default());
    let queue_config = QueueConfig::from_env();
    let queue = Arc::new(EventQueue::new(queue_config.max_queue_size));
    let ai = Arc::new(AiClient::from_env()?);

    // Workers: queue drainer, aggregation, summarization, heartbeat.
    let queue_handle = QueueWorker::new(
        queue.clone(),
        events.clone(),
        hub.clone(),
        queue_config,
    )
    .start();

    let aggregation_handle = AggregationWorker::new(
        events.clone(),
        incidents.clone(),
        SpikeDetector::new(stats, SpikeConfig::from_env()),
        ScoringConfig::from_env(),
        hub.clone(),
        AggregationConfig::from_env(),
    )
    .start();

    let summarizer = Arc::new(SummarizationWorker::new(
        events.clone(),
        incidents.clone(),
        ai.clone(),
        hub.clone(),
        Some(queue.clone()),
        SummarizeConfig::from_env(),
    ));
    let summarize_handle = summarizer.start();
    let heartbeat_handle = start_heartbeat(hub.clone());

    // Rate limiter plus its periodic cleanup.
    let limiter = Arc::new(SlidingWindowLimiter::new(RateLimitConfig::from_env()));
    {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let dropped = limiter.cleanup();
                if dropped > 0 {
                    tracing::debug!(subsystem = "api", dropped, "rate limiter cleanup");
                }
            }
        });
    }

    let state = AppState {
        events,
        incidents,
        queue,
        hub,
        ai,
        summarizer,
        limiter,
    };

    let cors = CorsLayer::new()
        .allow_origin(parse_allowed_origins())
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .layer(RequestBodyLimitLayer::new(defaults::MAX_BODY_SIZE_BYTES));

    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(defaults::SERVER_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "pulse-api listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Cooperative shutdown: workers finish their in-flight unit of
    // work; the queue flush runs last so buffered events persist.
    info!("stopping workers");
    aggregation_handle.shutdown().await;
    summarize_handle.shutdown().await;
    heartbeat_handle.shutdown().await;
    queue_handle.shutdown().await;
    info!("pulse-api stopped");
    Ok(())
}
