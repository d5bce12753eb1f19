use std::time::Duration;

use company_enrich::{
    app_state::AppState,
    config::AppConfig,
    db,
    services::{completion::CompletionClient, queue::ResumeQueue, storage::LogoStorage},
};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL_MS: u64 = 1_000;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting enrichment resume worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize services
    tracing::info!("Initializing services");
    let queue = ResumeQueue::new(&config.redis_url, &config.resume_queue_name)
        .expect("Failed to initialize resume queue");

    let completion = CompletionClient::new(
        config.completion_endpoint.clone(),
        config.completion_api_key.clone(),
        config.completion_model.clone(),
    );

    let storage = LogoStorage::new(
        &config.logo_bucket,
        &config.logo_endpoint,
        &config.logo_access_key,
        &config.logo_secret_key,
        &config.logo_public_base_url,
    )
    .expect("Failed to initialize logo storage");

    let state = AppState::new(db_pool, queue, completion, storage, config);

    tracing::info!("Worker ready, polling resume queue");

    // Main processing loop
    loop {
        match process_next_message(&state).await {
            Ok(true) => {
                tracing::debug!("Cycle processed, checking for next message");
            }
            Ok(false) => {
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing resume message, will retry");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

/// Consume one due resume message, if any.
/// Returns Ok(true) if a cycle ran, Ok(false) if the queue was empty.
async fn process_next_message(state: &AppState) -> Result<bool, Box<dyn std::error::Error>> {
    let message = match state.queue.dequeue_due().await? {
        Some(m) => m,
        None => return Ok(false),
    };

    tracing::info!(
        session_id = %message.session_id,
        reason = %message.reason,
        cycle = ?message.cycle_count,
        "Processing resume message"
    );

    let worker = state.resume_worker();
    match worker.run(&message).await {
        Ok(outcome) => {
            tracing::info!(
                session_id = %message.session_id,
                status = ?outcome.status,
                fields_resolved = outcome.fields_resolved,
                retryable_remaining = outcome.retryable_remaining,
                "Resume cycle complete"
            );
        }
        Err(e) => {
            // The message is already consumed; the session's own cycle
            // scheduling decides whether more work happens.
            tracing::error!(
                session_id = %message.session_id,
                error = %e,
                "Resume cycle failed"
            );
        }
    }
    Ok(true)
}
