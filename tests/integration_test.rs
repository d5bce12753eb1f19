use std::sync::Arc;

use company_enrich::{
    config::AppConfig,
    db::{self, store::DocumentStore, store::StoreError},
    models::{
        Address, CompanyDoc, ImportJob, ImportSession, JobState, RequestPayload, Review,
        SessionStatus, StageStatus,
    },
    services::completion::CompletionClient,
    services::logo::LogoEngine,
    services::queue::{ResumeMessage, ResumeQueue},
    services::storage::LogoStorage,
    workers::{primary::PrimaryWorker, resume::ResumeWorker},
};
use chrono::Utc;
use futures::future::join_all;
use uuid::Uuid;

/// Integration tests for the store and queue layers.
///
/// These require a running PostgreSQL and Redis instance configured via
/// environment variables (DATABASE_URL, REDIS_URL).
async fn test_store() -> DocumentStore {
    let config = AppConfig::from_env().expect("Failed to load config");
    let pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    DocumentStore::new(pool)
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_document_round_trip_and_partition_fallback() {
    let store = test_store().await;
    let session_id = Uuid::new_v4().to_string();

    let doc = CompanyDoc::seed(
        &session_id,
        format!("acme-{session_id}"),
        "Acme Integration".to_string(),
        Some("https://acme.example".to_string()),
        Some("acme.example".to_string()),
    );
    store.upsert(&doc.id, &doc).await.expect("upsert failed");

    // Point read with no partition hint must still find the document.
    let found = store
        .read(&doc.id, None)
        .await
        .expect("read failed")
        .expect("document missing");
    assert_eq!(found.partition_key, "acme.example");
    let decoded: CompanyDoc = found.decode().expect("decode failed");
    assert_eq!(decoded.company_name, "Acme Integration");

    store
        .delete(&found.partition_key, &found.id)
        .await
        .expect("cleanup failed");
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_version_conditioned_write_is_exclusive() {
    let store = test_store().await;
    let session_id = Uuid::new_v4().to_string();

    let payload = RequestPayload {
        query: "integration test".to_string(),
        website_url: None,
        limit: Some(1),
        requested_by: None,
    };
    let job = ImportJob::new(&session_id, payload);
    let stored = store.upsert(&job.id, &job).await.expect("upsert failed");

    // First conditional write wins.
    let mut claimed = job.clone();
    claimed.job_state = JobState::Running;
    claimed.locked_by = Some("worker-a".to_string());
    claimed.lock_expires_at = Some(Utc::now() + chrono::Duration::minutes(5));
    let after = store
        .replace_if_version(&stored.partition_key, &job.id, &claimed, stored.version)
        .await
        .expect("first claim failed");
    assert_eq!(after.version, stored.version + 1);

    // Second writer holding the stale version must lose.
    let mut rival = job.clone();
    rival.locked_by = Some("worker-b".to_string());
    let conflict = store
        .replace_if_version(&stored.partition_key, &job.id, &rival, stored.version)
        .await;
    assert!(matches!(conflict, Err(StoreError::VersionConflict { .. })));

    // The winner's lease is what persisted.
    let current: ImportJob = store
        .read(&job.id, None)
        .await
        .expect("read failed")
        .expect("job missing")
        .decode()
        .expect("decode failed");
    assert_eq!(current.locked_by.as_deref(), Some("worker-a"));

    store
        .delete(&after.partition_key, &job.id)
        .await
        .expect("cleanup failed");
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_session_companies_excludes_control_artifacts() {
    let store = test_store().await;
    let session_id = Uuid::new_v4().to_string();

    let company = CompanyDoc::seed(
        &session_id,
        format!("widget-{session_id}"),
        "Widget Co".to_string(),
        None,
        None,
    );
    store
        .upsert(&company.id, &company)
        .await
        .expect("company upsert failed");

    let job = ImportJob::new(
        &session_id,
        RequestPayload {
            query: "widgets".to_string(),
            website_url: None,
            limit: None,
            requested_by: None,
        },
    );
    store.upsert(&job.id, &job).await.expect("job upsert failed");

    let batch = store
        .session_companies(&session_id, 50)
        .await
        .expect("batch read failed");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].id, company.id);

    store
        .delete(&batch[0].partition_key, &batch[0].id)
        .await
        .expect("cleanup failed");
    store.delete("import", &job.id).await.expect("cleanup failed");
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_queue_delayed_visibility() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let queue_name = format!("it-{}", Uuid::new_v4().simple());
    let queue =
        ResumeQueue::new(&config.redis_url, &queue_name).expect("Failed to initialize queue");

    let session_id = Uuid::new_v4().to_string();
    let message = ResumeMessage {
        session_id: session_id.clone(),
        company_ids: None,
        reason: "integration".to_string(),
        requested_by: "test".to_string(),
        enqueue_at: Utc::now().to_rfc3339(),
        cycle_count: Some(1),
        run_id: None,
    };

    // Far-future visibility: the message must not be dequeued yet.
    queue
        .enqueue_resume(message.clone(), 60_000)
        .await
        .expect("enqueue failed");
    assert!(queue.dequeue_due().await.expect("dequeue failed").is_none());
    assert_eq!(queue.queue_depth().await.expect("depth failed"), 1);

    // Immediate visibility: the message comes back once due.
    let mut immediate = message;
    immediate.cycle_count = Some(2);
    queue
        .enqueue_resume(immediate, 0)
        .await
        .expect("enqueue failed");
    let got = queue
        .dequeue_due()
        .await
        .expect("dequeue failed")
        .expect("expected a due message");
    assert_eq!(got.session_id, session_id);
    assert_eq!(got.cycle_count, Some(2));
}

/// In-process stand-in for the upstream completion endpoint. Always
/// answers with the given chat content.
async fn spawn_completion_stub(content: &str) -> String {
    let body = serde_json::json!({
        "choices": [ { "message": { "content": content } } ]
    });
    let app = axum::Router::new().route(
        "/chat",
        axum::routing::post(move || async move { axum::Json(body) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind failed");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{addr}/chat")
}

fn test_queue(config: &AppConfig) -> ResumeQueue {
    let queue_name = format!("it-{}", Uuid::new_v4().simple());
    ResumeQueue::new(&config.redis_url, &queue_name).expect("Failed to initialize queue")
}

fn test_resume_worker(
    store: DocumentStore,
    queue: Arc<ResumeQueue>,
    config: Arc<AppConfig>,
    completion_endpoint: &str,
) -> ResumeWorker {
    let completion = Arc::new(CompletionClient::new(
        completion_endpoint.to_string(),
        "test-key".to_string(),
        "test-model".to_string(),
    ));
    let storage = LogoStorage::new("it-logos", "http://127.0.0.1:9", "k", "s", "")
        .expect("Failed to build storage");
    let logo = Arc::new(LogoEngine::new(Arc::new(storage)));
    ResumeWorker::new(store, completion, logo, queue, config)
}

/// A company with every field already settled, so a cycle over it makes
/// no upstream calls.
fn settled_company(session_id: &str) -> CompanyDoc {
    let mut doc = CompanyDoc::seed(
        session_id,
        format!("settled-{session_id}"),
        "Settled Co".to_string(),
        Some("https://settled.example".to_string()),
        Some("settled.example".to_string()),
    );
    doc.industries = vec!["Manufacturing".to_string()];
    doc.product_keywords = vec!["widgets".to_string()];
    doc.tagline = Some("Widgets since 1912".to_string());
    doc.headquarters_location = Some(Address::raw_only("Springfield, USA"));
    doc.manufacturing_locations = vec![Address::raw_only("Shelbyville, USA")];
    doc.reviews = vec![Review {
        source_url: "https://reviews.example/settled".to_string(),
        title: None,
        snippet: Some("good widgets".to_string()),
        rating: Some(4.5),
    }];
    doc.reviews_stage_status = StageStatus::Complete;
    doc.logo_url = Some("https://cdn.example/settled.png".to_string());
    doc.logo_stage_status = StageStatus::Complete;
    doc
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_primary_single_company_runs_to_early_exit() {
    let store = test_store().await;
    let config = Arc::new(AppConfig::from_env().expect("Failed to load config"));
    let queue = Arc::new(test_queue(&config));
    let session_id = Uuid::new_v4().to_string();

    let endpoint = spawn_completion_stub(
        r#"[{"name":"Acme Widgets","website_url":"https://acme-widgets.example"}]"#,
    )
    .await;
    let completion = Arc::new(CompletionClient::new(
        endpoint,
        "test-key".to_string(),
        "test-model".to_string(),
    ));

    let session = ImportSession::new(
        &session_id,
        "acme widgets".to_string(),
        Some("https://acme-widgets.example".to_string()),
        true,
        None,
    );
    store
        .upsert(&session.id, &session)
        .await
        .expect("session upsert failed");
    let job = ImportJob::new(
        &session_id,
        RequestPayload {
            query: "acme widgets".to_string(),
            website_url: Some("https://acme-widgets.example".to_string()),
            limit: Some(1),
            requested_by: None,
        },
    );
    store.upsert(&job.id, &job).await.expect("job upsert failed");

    let worker = PrimaryWorker::new(store.clone(), completion, queue.clone(), config);
    let outcome = worker.run(&session_id).await.expect("primary run failed");

    assert!(outcome.claimed);
    assert_eq!(outcome.job_state, JobState::Complete);
    assert_eq!(outcome.stage_beacon, "primary_early_exit");
    assert_eq!(outcome.candidates_found, 1);

    // The one candidate was seeded and the session knows about it.
    let companies = store
        .session_companies(&session_id, 10)
        .await
        .expect("batch read failed");
    assert_eq!(companies.len(), 1);
    let seeded: CompanyDoc = companies[0].decode().expect("decode failed");
    assert_eq!(seeded.company_name, "Acme Widgets");
    let current: ImportSession = store
        .read(&session.id, None)
        .await
        .expect("read failed")
        .expect("session missing")
        .decode()
        .expect("decode failed");
    assert_eq!(current.companies_count, 1);

    // Completion hands off to the enrichment queue immediately.
    let message = queue
        .dequeue_due()
        .await
        .expect("dequeue failed")
        .expect("expected a resume message");
    assert_eq!(message.session_id, session_id);
    assert_eq!(message.reason, "primary_complete");
    assert_eq!(message.cycle_count, Some(0));

    for doc in &companies {
        store
            .delete(&doc.partition_key, &doc.id)
            .await
            .expect("cleanup failed");
    }
    store.delete("import", &job.id).await.expect("cleanup failed");
    store
        .delete("import", &session.id)
        .await
        .expect("cleanup failed");
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_concurrent_resume_cycles_have_a_single_winner() {
    let store = test_store().await;
    let config = Arc::new(AppConfig::from_env().expect("Failed to load config"));
    let queue = Arc::new(test_queue(&config));
    let session_id = Uuid::new_v4().to_string();

    let session = ImportSession::new(&session_id, "settled".to_string(), None, false, None);
    store
        .upsert(&session.id, &session)
        .await
        .expect("session upsert failed");
    let company = settled_company(&session_id);
    store
        .upsert(&company.id, &company)
        .await
        .expect("company upsert failed");

    let worker_a = test_resume_worker(
        store.clone(),
        queue.clone(),
        config.clone(),
        "http://127.0.0.1:9/unreachable",
    );
    let worker_b = worker_a.clone();
    let message_a = ResumeMessage {
        session_id: session_id.clone(),
        company_ids: None,
        reason: "primary_complete".to_string(),
        requested_by: "test".to_string(),
        enqueue_at: Utc::now().to_rfc3339(),
        cycle_count: Some(0),
        run_id: Some(Uuid::new_v4().to_string()),
    };
    let mut message_b = message_a.clone();
    message_b.run_id = Some(Uuid::new_v4().to_string());

    let outcomes = join_all(vec![worker_a.run(&message_a), worker_b.run(&message_b)]).await;
    let outcomes: Vec<_> = outcomes
        .into_iter()
        .map(|r| r.expect("resume run failed"))
        .collect();

    // The session lease admits exactly one cycle; the other yields
    // without touching any company.
    let winners = outcomes.iter().filter(|o| o.claimed).count();
    assert_eq!(winners, 1);

    let current: ImportSession = store
        .read(&session.id, None)
        .await
        .expect("read failed")
        .expect("session missing")
        .decode()
        .expect("decode failed");
    assert_eq!(current.status, SessionStatus::Complete);
    assert_eq!(current.cycle_count, 1);
    assert!(current.locked_by.is_none());

    // Nothing was attempted twice on the already-settled company.
    let after: CompanyDoc = store
        .read(&company.id, None)
        .await
        .expect("read failed")
        .expect("company missing")
        .decode()
        .expect("decode failed");
    assert!(after.import_attempts.values().all(|n| *n <= 1));

    store
        .delete(&company.partition_key, &company.id)
        .await
        .expect("cleanup failed");
    store
        .delete("import", &session.id)
        .await
        .expect("cleanup failed");
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_stale_resume_message_never_rewinds_the_session() {
    let store = test_store().await;
    let config = Arc::new(AppConfig::from_env().expect("Failed to load config"));
    let queue = Arc::new(test_queue(&config));
    let session_id = Uuid::new_v4().to_string();

    let mut session = ImportSession::new(&session_id, "settled".to_string(), None, false, None);
    session.cycle_count = 5;
    store
        .upsert(&session.id, &session)
        .await
        .expect("session upsert failed");

    let worker = test_resume_worker(
        store.clone(),
        queue,
        config,
        "http://127.0.0.1:9/unreachable",
    );
    let message = ResumeMessage {
        session_id: session_id.clone(),
        company_ids: None,
        reason: "watcher".to_string(),
        requested_by: "test".to_string(),
        enqueue_at: Utc::now().to_rfc3339(),
        cycle_count: Some(2),
        run_id: None,
    };
    let outcome = worker.run(&message).await.expect("resume run failed");

    // A late redelivery from an earlier cycle is dropped on the floor.
    assert!(!outcome.claimed);
    let current: ImportSession = store
        .read(&session.id, None)
        .await
        .expect("read failed")
        .expect("session missing")
        .decode()
        .expect("decode failed");
    assert_eq!(current.cycle_count, 5);
    assert_eq!(current.status, SessionStatus::Running);
    assert!(current.locked_by.is_none());

    store
        .delete("import", &session.id)
        .await
        .expect("cleanup failed");
}

#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_stop_flag_halts_resume_cycle_before_any_work() {
    let store = test_store().await;
    let config = Arc::new(AppConfig::from_env().expect("Failed to load config"));
    let queue = Arc::new(test_queue(&config));
    let session_id = Uuid::new_v4().to_string();

    let session = ImportSession::new(&session_id, "settled".to_string(), None, false, None);
    store
        .upsert(&session.id, &session)
        .await
        .expect("session upsert failed");
    let company = settled_company(&session_id);
    store
        .upsert(&company.id, &company)
        .await
        .expect("company upsert failed");

    let flag_id = ImportSession::stop_flag_id(&session_id);
    let flag = serde_json::json!({
        "id": flag_id,
        "partition_key": "import",
        "session_id": session_id,
        "requested_at": Utc::now(),
    });
    store.upsert(&flag_id, &flag).await.expect("flag upsert failed");

    let worker = test_resume_worker(
        store.clone(),
        queue,
        config,
        "http://127.0.0.1:9/unreachable",
    );
    let message = ResumeMessage {
        session_id: session_id.clone(),
        company_ids: None,
        reason: "primary_complete".to_string(),
        requested_by: "test".to_string(),
        enqueue_at: Utc::now().to_rfc3339(),
        cycle_count: Some(0),
        run_id: None,
    };
    let outcome = worker.run(&message).await.expect("resume run failed");

    assert!(outcome.stopped);
    assert!(!outcome.claimed);
    assert_eq!(outcome.status, SessionStatus::Stopped);
    let current: ImportSession = store
        .read(&session.id, None)
        .await
        .expect("read failed")
        .expect("session missing")
        .decode()
        .expect("decode failed");
    assert_eq!(current.status, SessionStatus::Stopped);

    store
        .delete(&company.partition_key, &company.id)
        .await
        .expect("cleanup failed");
    store.delete("import", &flag_id).await.expect("cleanup failed");
    store
        .delete("import", &session.id)
        .await
        .expect("cleanup failed");
}
