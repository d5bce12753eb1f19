use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::{ImportJob, ImportSession, RequestPayload};
use crate::services::budget::Budget;
use crate::services::queue::ResumeMessage;
use crate::workers::WorkerError;

const IMPORT_ONE_POLL_MS: u64 = 500;

/// Domain-level failures are a 200 with `ok:false`, never a 5xx: callers
/// behind 5xx-intolerant gateways still get actionable JSON.
fn domain_error(code: &str, detail: impl Into<String>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({ "ok": false, "error": code, "detail": detail.into() })),
    )
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub query: String,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

/// POST /import/start — create the session and its queued primary job.
pub async fn start_import(
    State(state): State<AppState>,
    Json(body): Json<StartRequest>,
) -> (StatusCode, Json<Value>) {
    let query = body.query.trim().to_string();
    if query.is_empty() {
        return domain_error("invalid_request", "query is required");
    }

    let session_id = Uuid::new_v4().to_string();
    let payload = RequestPayload {
        query: query.clone(),
        website_url: body.website_url.clone(),
        limit: body.limit,
        requested_by: body.requested_by.clone(),
    };
    let session = ImportSession::new(
        &session_id,
        query,
        body.website_url,
        payload.single_company(),
        body.requested_by,
    );
    let job = ImportJob::new(&session_id, payload);

    if let Err(err) = state.store.upsert(&session.id, &session).await {
        error!(error = %err, "failed to create session document");
        return domain_error("store_write_failed", err.to_string());
    }
    if let Err(err) = state.store.upsert(&job.id, &job).await {
        error!(error = %err, "failed to create primary job document");
        return domain_error("store_write_failed", err.to_string());
    }

    info!(session_id, "import session created");
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "session_id": session_id,
            "job_id": job.id,
            "job_state": job.job_state,
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

/// POST /import/primary-worker — one invocation of the primary search
/// worker. 202 while the job is still in progress, 200 once terminal.
pub async fn run_primary_worker(
    State(state): State<AppState>,
    Json(body): Json<SessionRequest>,
) -> (StatusCode, Json<Value>) {
    let worker = state.primary_worker();
    match worker.run(&body.session_id).await {
        Ok(outcome) => {
            let status = if outcome.is_running() {
                StatusCode::ACCEPTED
            } else {
                StatusCode::OK
            };
            let ok = outcome.last_error.is_none();
            (status, Json(json!({ "ok": ok, "job": outcome })))
        }
        Err(WorkerError::JobNotFound(session_id)) => {
            domain_error("job_not_found", format!("no primary job for '{session_id}'"))
        }
        Err(err) => {
            error!(session_id = %body.session_id, error = %err, "primary worker failed");
            domain_error("worker_failed", err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub session_id: String,
    #[serde(default)]
    pub company_ids: Option<Vec<String>>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub cycle_count: Option<u32>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub delay_ms: Option<i64>,
}

fn to_message(body: &ResumeRequest) -> ResumeMessage {
    ResumeMessage {
        session_id: body.session_id.clone(),
        company_ids: body.company_ids.clone(),
        reason: body
            .reason
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "manual".to_string()),
        requested_by: body
            .requested_by
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "system".to_string()),
        enqueue_at: Utc::now().to_rfc3339(),
        cycle_count: body.cycle_count,
        run_id: body.run_id.clone(),
    }
}

/// POST /import/resume-worker — one resume cycle, shared by the HTTP path
/// and the queue consumer.
pub async fn run_resume_worker(
    State(state): State<AppState>,
    Json(body): Json<ResumeRequest>,
) -> (StatusCode, Json<Value>) {
    if body.session_id.trim().is_empty() {
        return domain_error("invalid_request", "session_id is required");
    }
    let message = to_message(&body);
    let worker = state.resume_worker();
    match worker.run(&message).await {
        Ok(outcome) => (StatusCode::OK, Json(json!({ "ok": true, "cycle": outcome }))),
        Err(WorkerError::SessionNotFound(session_id)) => {
            domain_error("session_not_found", format!("no session '{session_id}'"))
        }
        Err(err) => {
            error!(session_id = %body.session_id, error = %err, "resume worker failed");
            domain_error("worker_failed", err.to_string())
        }
    }
}

/// POST /import/resume-enqueue — operator-triggered resumption request.
pub async fn enqueue_resume(
    State(state): State<AppState>,
    Json(body): Json<ResumeRequest>,
) -> (StatusCode, Json<Value>) {
    if body.session_id.trim().is_empty() {
        return domain_error("invalid_request", "session_id is required");
    }
    let message = to_message(&body);
    match state
        .queue
        .enqueue_resume(message, body.delay_ms.unwrap_or(0))
        .await
    {
        Ok(receipt) => (
            StatusCode::OK,
            Json(json!({
                "ok": true,
                "queue": receipt.queue,
                "visible_at_ms": receipt.visible_at_ms,
            })),
        ),
        Err(err) => {
            error!(session_id = %body.session_id, error = %err, "resume enqueue failed");
            domain_error("enqueue_failed", err.to_string())
        }
    }
}

/// POST /import/stop — raise the cooperative stop flag. The next resume
/// cycle sees it and halts the session.
pub async fn stop_import(
    State(state): State<AppState>,
    Json(body): Json<SessionRequest>,
) -> (StatusCode, Json<Value>) {
    let session_id = body.session_id.trim();
    if session_id.is_empty() {
        return domain_error("invalid_request", "session_id is required");
    }
    let flag = json!({
        "id": ImportSession::stop_flag_id(session_id),
        "partition_key": "import",
        "session_id": session_id,
        "requested_at": Utc::now(),
    });
    let flag_id = ImportSession::stop_flag_id(session_id);
    match state.store.upsert(&flag_id, &flag).await {
        Ok(_) => {
            info!(session_id, "stop flag raised");
            (StatusCode::OK, Json(json!({ "ok": true, "stop_flag_id": flag_id })))
        }
        Err(err) => domain_error("store_write_failed", err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ImportOneRequest {
    pub query: String,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

/// POST /import-one — single-URL convenience wrapper: creates a
/// single-company session and drives the primary worker in-process until
/// it terminates or the 25s budget runs out.
pub async fn import_one(
    State(state): State<AppState>,
    Json(body): Json<ImportOneRequest>,
) -> (StatusCode, Json<Value>) {
    let query = body.query.trim().to_string();
    if query.is_empty() {
        return domain_error("invalid_request", "query is required");
    }

    let session_id = Uuid::new_v4().to_string();
    let payload = RequestPayload {
        query: query.clone(),
        website_url: body.website_url.clone(),
        limit: Some(1),
        requested_by: body.requested_by.clone(),
    };
    let session = ImportSession::new(&session_id, query, body.website_url, true, body.requested_by);
    let job = ImportJob::new(&session_id, payload);
    if let Err(err) = state.store.upsert(&session.id, &session).await {
        return domain_error("store_write_failed", err.to_string());
    }
    if let Err(err) = state.store.upsert(&job.id, &job).await {
        return domain_error("store_write_failed", err.to_string());
    }

    let budget = Budget::default_cap();
    let worker = state.primary_worker();
    loop {
        match worker.run(&session_id).await {
            Ok(outcome) if !outcome.is_running() => {
                let ok = outcome.last_error.is_none();
                return (
                    StatusCode::OK,
                    Json(json!({ "ok": ok, "session_id": session_id, "job": outcome })),
                );
            }
            Ok(outcome) => {
                if budget.should_defer_stage(1_000) {
                    return (
                        StatusCode::OK,
                        Json(json!({
                            "ok": false,
                            "error": "deadline_exceeded",
                            "session_id": session_id,
                            "job": outcome,
                        })),
                    );
                }
                tokio::time::sleep(Duration::from_millis(IMPORT_ONE_POLL_MS)).await;
            }
            Err(err) => {
                error!(session_id, error = %err, "import-one invocation failed");
                return domain_error("worker_failed", err.to_string());
            }
        }
    }
}
