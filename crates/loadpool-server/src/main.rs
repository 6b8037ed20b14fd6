// Loadpool server
// Decision: One process hosts both the submission endpoint and the supervised workers
// Decision: Jobs simulate work by sleeping JOB_DURATION_MS

mod config;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method};
use axum::Router;
use loadpool::{simulated_work, InMemoryJobQueue, WorkerPool};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "loadpool=debug,loadpool_server=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("loadpool-server starting...");

    let config = ServerConfig::from_env();
    tracing::info!(
        port = config.port,
        worker_count = config.pool.worker_count,
        queue = %config.pool.queue_name,
        concurrency = config.pool.concurrency,
        max_attempts = config.pool.retry_policy.max_attempts,
        job_duration_ms = config.job_duration.as_millis() as u64,
        "Configuration loaded"
    );

    let queue = Arc::new(InMemoryJobQueue::new());
    let pool = Arc::new(
        WorkerPool::new(
            queue,
            config.pool.clone(),
            simulated_work(config.job_duration),
        )
        .context("Invalid worker pool configuration")?,
    );
    pool.start().await.context("Failed to start worker pool")?;

    let app = build_app(routes::AppState::new(pool.clone()), &config);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", addr);

    let server = async move { axum::serve(listener, app).await };

    let outcome = tokio::select! {
        result = server => result.context("Server error"),
        result = pool.wait() => result.context("Worker pool supervisor stopped"),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
    };

    if let Err(e) = pool.shutdown().await {
        tracing::warn!("Worker pool shutdown incomplete: {}", e);
    }
    tracing::info!("loadpool-server stopped");

    outcome
}

/// Routes plus CORS and tracing layers
fn build_app(state: routes::AppState, config: &ServerConfig) -> Router {
    let app = routes::routes(state);

    let cors_origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let app = if cors_origins.is_empty() {
        tracing::info!("CORS not configured (same-origin requests only)");
        app
    } else {
        tracing::info!(origins = ?cors_origins, "CORS origins configured");
        app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(cors_origins))
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN]),
        )
    };

    app.layer(TraceLayer::new_for_http())
}
