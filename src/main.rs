mod app_state;
mod config;
mod db;
mod models;
mod routes;
mod services;
mod workers;

use std::sync::Arc;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use services::{completion::CompletionClient, queue::ResumeQueue, storage::LogoStorage};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing company-enrich server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!(
        "import_primary_completed_total",
        "Primary search jobs that completed with candidates"
    );
    metrics::describe_counter!(
        "import_primary_errors_total",
        "Primary search jobs force-errored, by code"
    );
    metrics::describe_counter!(
        "import_resume_cycles_total",
        "Resume worker cycles executed"
    );
    metrics::describe_counter!(
        "import_fields_resolved_total",
        "Company fields resolved by enrichment"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL document store");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize Redis resume queue
    tracing::info!("Connecting to Redis resume queue");
    let queue = ResumeQueue::new(&config.redis_url, &config.resume_queue_name)
        .expect("Failed to initialize resume queue");

    // Initialize upstream completion client
    let completion = CompletionClient::new(
        config.completion_endpoint.clone(),
        config.completion_api_key.clone(),
        config.completion_model.clone(),
    );

    // Initialize logo object storage
    tracing::info!("Initializing logo object storage");
    let storage = LogoStorage::new(
        &config.logo_bucket,
        &config.logo_endpoint,
        &config.logo_access_key,
        &config.logo_secret_key,
        &config.logo_public_base_url,
    )
    .expect("Failed to initialize logo storage");

    // Create shared application state
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(db_pool, queue, completion, storage, config);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/import/start", post(routes::import::start_import))
        .route(
            "/import/primary-worker",
            post(routes::import::run_primary_worker),
        )
        .route(
            "/import/resume-worker",
            post(routes::import::run_resume_worker),
        )
        .route(
            "/import/resume-enqueue",
            post(routes::import::enqueue_resume),
        )
        .route("/import/stop", post(routes::import::stop_import))
        .route("/import-one", post(routes::import::import_one))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024)); // 1 MB limit

    tracing::info!("Starting company-enrich on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
