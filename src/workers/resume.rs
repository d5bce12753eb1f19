use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::store::{DocumentStore, StoreError, StoredDoc};
use crate::models::{
    Address, CompanyDoc, EnrichField, ImportSession, MissingReason, Review, SessionStatus,
    StageStatus, JOB_PARTITION,
};
use crate::services::budget::{Budget, StageLimits};
use crate::services::completion::{extract_json_array, extract_json_object, CompletionClient};
use crate::services::enrichment::{
    bump_field_attempt, mark_enrichment_incomplete, mark_field_error, mark_field_success,
    force_terminalize_remaining, merge::merge_company, note_review_attempt, quality,
    record_missing, scrub_placeholders,
};
use crate::services::logo::{LogoEngine, LogoImportStatus, LogoRequest};
use crate::services::queue::{ResumeMessage, ResumeQueue};

use super::WorkerError;

const MAX_CONCURRENT_COMPANIES: usize = 4;
const BATCH_LIMIT: i64 = 50;
const NEXT_CYCLE_DELAY_MS: i64 = 15_000;
const LOGO_WAIT_DESIRED_MS: u64 = 5_000;

/// What one resume cycle accomplished.
#[derive(Debug, Clone, Serialize)]
pub struct ResumeRunOutcome {
    pub session_id: String,
    pub status: SessionStatus,
    pub cycle_count: u32,
    /// Whether this invocation held the session lease and did field work,
    /// as opposed to yielding to a concurrent cycle or a stale message.
    pub claimed: bool,
    pub companies_processed: u32,
    pub fields_resolved: u32,
    pub retryable_remaining: u32,
    pub stopped: bool,
    pub next_cycle_scheduled: bool,
}

struct CompanyReport {
    fields_resolved: u32,
    retryable_remaining: u32,
    logo_done: Option<oneshot::Receiver<LogoImportStatus>>,
}

enum FieldResult {
    Resolved,
    Missing(MissingReason),
    Errored(String),
}

/// Per-cycle enrichment worker. Consumes one resume message, walks the
/// session's companies field by field under the invocation budget, and
/// either schedules the next cycle or closes the session.
#[derive(Clone)]
pub struct ResumeWorker {
    store: DocumentStore,
    completion: Arc<CompletionClient>,
    logo: Arc<LogoEngine>,
    queue: Arc<ResumeQueue>,
    config: Arc<AppConfig>,
}

impl ResumeWorker {
    pub fn new(
        store: DocumentStore,
        completion: Arc<CompletionClient>,
        logo: Arc<LogoEngine>,
        queue: Arc<ResumeQueue>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            completion,
            logo,
            queue,
            config,
        }
    }

    pub async fn run(&self, message: &ResumeMessage) -> Result<ResumeRunOutcome, WorkerError> {
        let session_id = message.session_id.as_str();
        let session_doc_id = ImportSession::doc_id(session_id);
        let stored = self
            .store
            .read(&session_doc_id, None)
            .await?
            .ok_or_else(|| WorkerError::SessionNotFound(session_id.to_string()))?;
        let mut session: ImportSession = stored.decode()?;
        let mut version = stored.version;

        // The stop flag is cooperative: its mere existence halts the
        // session before any further upstream spend.
        if self
            .store
            .exists(&ImportSession::stop_flag_id(session_id))
            .await?
        {
            info!(session_id, "stop flag present, halting session");
            if !session.is_terminal() {
                session.status = SessionStatus::Stopped;
                session.updated_at = Utc::now();
                self.store.upsert(&session.id, &session).await?;
            }
            return Ok(self.outcome(&session, false, 0, 0, 0, true, false));
        }

        if session.is_terminal() {
            debug!(session_id, status = ?session.status, "session already terminal");
            return Ok(self.outcome(&session, false, 0, 0, 0, false, false));
        }

        // A message carrying an older cycle number than the session has
        // already consumed is a late redelivery; acting on it would rewind
        // the counter and extend the session past the cycle cap.
        if message_is_stale(session.cycle_count, message.cycle_count) {
            debug!(
                session_id,
                session_cycle = session.cycle_count,
                message_cycle = ?message.cycle_count,
                "stale resume message dropped"
            );
            return Ok(self.outcome(&session, false, 0, 0, 0, false, false));
        }

        // One cycle at a time per session. The version-conditioned write
        // is the claim; the loser yields without touching any company.
        let now = Utc::now();
        if !session.lease_expired(now) {
            debug!(session_id, locked_by = ?session.locked_by, "resume lease held elsewhere");
            return Ok(self.outcome(&session, false, 0, 0, 0, false, false));
        }
        session.locked_by = Some(format!("resume-{}", Uuid::new_v4()));
        session.lock_expires_at =
            Some(now + chrono::Duration::milliseconds(self.config.lock_ttl_ms as i64));
        session.last_heartbeat_at = Some(now);
        match self.save_session(&mut session, &mut version).await {
            Ok(()) => {}
            Err(StoreError::VersionConflict { .. }) => {
                debug!(session_id, "resume lease claim lost");
                return Ok(self.outcome(&session, false, 0, 0, 0, false, false));
            }
            Err(err) => return Err(err.into()),
        }

        let request_id = message
            .run_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let budget = Budget::default_cap();
        metrics::counter!("import_resume_cycles_total").increment(1);

        let batch = self.load_batch(session_id, message).await?;
        let processed = batch.len() as u32;

        let sem = Arc::new(Semaphore::new(MAX_CONCURRENT_COMPANIES));
        let mut set: JoinSet<Result<CompanyReport, WorkerError>> = JoinSet::new();
        for doc in batch {
            let Ok(permit) = sem.clone().acquire_owned().await else {
                break;
            };
            let worker = self.clone();
            let budget = budget.clone();
            let request_id = request_id.clone();
            set.spawn(async move {
                let _permit = permit;
                worker.process_company(doc, budget, request_id).await
            });
        }

        let mut fields_resolved: u32 = 0;
        let mut retryable_remaining: u32 = 0;
        let mut logo_waits = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(report)) => {
                    fields_resolved += report.fields_resolved;
                    retryable_remaining += report.retryable_remaining;
                    if let Some(rx) = report.logo_done {
                        logo_waits.push(rx);
                    }
                }
                Ok(Err(err)) => warn!(session_id, error = %err, "company enrichment failed"),
                Err(err) => warn!(session_id, error = %err, "enrichment task panicked"),
            }
        }

        // The batch is done but finalization still writes; renew the
        // lease so a watcher does not hand the session to someone else.
        if !self.renew_lease(&mut session, &mut version).await? {
            warn!(session_id, "resume lease lost mid-cycle, yielding");
            return Ok(self.outcome(
                &session,
                true,
                processed,
                fields_resolved,
                retryable_remaining,
                false,
                false,
            ));
        }

        // Logo imports run detached; give them what is left of the budget
        // but never block the cycle on them.
        for rx in logo_waits {
            if budget.should_defer_stage(1_000) {
                break;
            }
            let wait = budget.clamp_stage_timeout(StageLimits {
                desired_ms: LOGO_WAIT_DESIRED_MS,
                ..StageLimits::default()
            });
            let _ = tokio::time::timeout(wait, rx).await;
        }

        session.cycle_count = next_cycle_count(session.cycle_count, message.cycle_count);

        // A stop raised while the batch ran still wins before any further
        // cycle is scheduled.
        if self
            .store
            .exists(&ImportSession::stop_flag_id(session_id))
            .await?
        {
            info!(session_id, "stop flag raised mid-cycle, halting session");
            session.status = SessionStatus::Stopped;
            self.release(&mut session, &mut version).await?;
            return Ok(self.outcome(
                &session,
                true,
                processed,
                fields_resolved,
                retryable_remaining,
                true,
                false,
            ));
        }

        let mut next_cycle_scheduled = false;
        if retryable_remaining > 0 {
            if session.cycle_count < self.config.max_resume_cycles {
                next_cycle_scheduled = self.schedule_next_cycle(&mut session, message).await;
            } else {
                info!(
                    session_id,
                    cycle = session.cycle_count,
                    "cycle cap reached, terminalizing remaining fields"
                );
                self.finalize_companies(session_id, true).await?;
                retryable_remaining = 0;
                session.status = SessionStatus::Complete;
            }
        } else {
            self.finalize_companies(session_id, false).await?;
            session.status = SessionStatus::Complete;
        }

        self.release(&mut session, &mut version).await?;
        metrics::counter!("import_fields_resolved_total").increment(fields_resolved as u64);
        info!(
            session_id,
            cycle = session.cycle_count,
            processed,
            fields_resolved,
            retryable_remaining,
            "resume cycle finished"
        );
        Ok(self.outcome(
            &session,
            true,
            processed,
            fields_resolved,
            retryable_remaining,
            false,
            next_cycle_scheduled,
        ))
    }

    fn outcome(
        &self,
        session: &ImportSession,
        claimed: bool,
        processed: u32,
        fields_resolved: u32,
        retryable_remaining: u32,
        stopped: bool,
        next_cycle_scheduled: bool,
    ) -> ResumeRunOutcome {
        ResumeRunOutcome {
            session_id: session.session_id.clone(),
            status: session.status,
            cycle_count: session.cycle_count,
            claimed,
            companies_processed: processed,
            fields_resolved,
            retryable_remaining,
            stopped,
            next_cycle_scheduled,
        }
    }

    async fn save_session(
        &self,
        session: &mut ImportSession,
        version: &mut i64,
    ) -> Result<(), StoreError> {
        session.updated_at = Utc::now();
        let stored = self
            .store
            .replace_if_version(JOB_PARTITION, &session.id, session, *version)
            .await?;
        *version = stored.version;
        Ok(())
    }

    /// Renew the session lease. `Ok(false)` means another writer moved the
    /// session out from under us and this cycle must stop writing to it.
    async fn renew_lease(
        &self,
        session: &mut ImportSession,
        version: &mut i64,
    ) -> Result<bool, WorkerError> {
        let now = Utc::now();
        session.last_heartbeat_at = Some(now);
        session.lock_expires_at =
            Some(now + chrono::Duration::milliseconds(self.config.lock_ttl_ms as i64));
        match self.save_session(session, version).await {
            Ok(()) => Ok(true),
            Err(StoreError::VersionConflict { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Clear the lease and write the cycle's outcome. On a conflict the
    /// outcome is folded onto the current copy instead of clobbering it.
    async fn release(
        &self,
        session: &mut ImportSession,
        version: &mut i64,
    ) -> Result<(), WorkerError> {
        session.locked_by = None;
        session.lock_expires_at = None;
        match self.save_session(session, version).await {
            Ok(()) => Ok(()),
            Err(StoreError::VersionConflict { .. }) => {
                let Some(current) = self.store.read(&session.id, None).await? else {
                    return Ok(());
                };
                let mut latest: ImportSession = current.decode()?;
                latest.cycle_count = latest.cycle_count.max(session.cycle_count);
                if latest.status == SessionStatus::Running {
                    latest.status = session.status;
                }
                if session.last_error.is_some() {
                    latest.last_error = session.last_error.clone();
                }
                latest.locked_by = None;
                latest.lock_expires_at = None;
                latest.updated_at = Utc::now();
                self.store.upsert(&latest.id, &latest).await?;
                *session = latest;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn load_batch(
        &self,
        session_id: &str,
        message: &ResumeMessage,
    ) -> Result<Vec<StoredDoc>, WorkerError> {
        match &message.company_ids {
            Some(ids) => {
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.store.read(id, None).await? {
                        Some(doc) => out.push(doc),
                        None => warn!(session_id, company_id = %id, "targeted company missing"),
                    }
                }
                Ok(out)
            }
            None => Ok(self.store.session_companies(session_id, BATCH_LIMIT).await?),
        }
    }

    async fn process_company(
        &self,
        stored: StoredDoc,
        budget: Budget,
        request_id: String,
    ) -> Result<CompanyReport, WorkerError> {
        let mut doc: CompanyDoc = stored.decode()?;
        let mut resolved: u32 = 0;
        let mut logo_done = None;
        let cap = self.config.max_field_attempts;

        // The stop flag is polled per batch item, not just at cycle start,
        // so a stop raised mid-batch saves the remaining upstream spend.
        if self
            .store
            .exists(&ImportSession::stop_flag_id(&doc.session_id))
            .await?
        {
            debug!(company_id = %doc.id, "stop flag raised, skipping company");
            return Ok(CompanyReport {
                fields_resolved: 0,
                retryable_remaining: doc.retryable_fields().len() as u32,
                logo_done: None,
            });
        }

        if scrub_placeholders(&mut doc) {
            self.persist(&mut doc).await?;
        }

        for field in EnrichField::ALL {
            if doc.field_terminal(field) {
                continue;
            }
            if budget.should_defer_stage(3_000) {
                debug!(company_id = %doc.id, field = field.as_str(), "budget low, deferring");
                break;
            }
            // One attempt per field per request id, so a re-delivered
            // message cannot burn extra attempts.
            if !bump_field_attempt(&mut doc, field, &request_id) {
                continue;
            }

            if field == EnrichField::Logo {
                if doc.normalized_domain.is_none() && doc.website_url.is_none() {
                    record_missing(&mut doc, field, MissingReason::NotFound, cap);
                    self.persist(&mut doc).await?;
                } else {
                    self.persist(&mut doc).await?;
                    logo_done = Some(self.spawn_logo_task(&doc));
                }
                continue;
            }

            let result = if field == EnrichField::Reviews {
                self.enrich_reviews(&mut doc, &budget).await
            } else {
                self.enrich_upstream_field(&mut doc, field, &budget).await
            };
            match result {
                FieldResult::Resolved => resolved += 1,
                FieldResult::Missing(reason) => {
                    record_missing(&mut doc, field, reason, cap);
                }
                FieldResult::Errored(err) => {
                    mark_field_error(&mut doc, field, &err);
                    if field == EnrichField::Reviews {
                        note_review_attempt(&mut doc, "", Some(&err));
                    }
                    record_missing(&mut doc, field, MissingReason::Missing, cap);
                }
            }
            self.persist(&mut doc).await?;
        }

        let retryable = doc.retryable_fields().len() as u32;
        Ok(CompanyReport {
            fields_resolved: resolved,
            retryable_remaining: retryable,
            logo_done,
        })
    }

    async fn enrich_upstream_field(
        &self,
        doc: &mut CompanyDoc,
        field: EnrichField,
        budget: &Budget,
    ) -> FieldResult {
        let prompt = build_field_prompt(doc, field);
        let timeout = budget.clamp_stage_timeout(StageLimits::default());
        let text = match self.completion.chat(&prompt, timeout).await {
            Ok(text) => text,
            Err(err) => return FieldResult::Errored(err.to_string()),
        };
        let Some(answer) = extract_json_object(&text) else {
            return FieldResult::Errored("unparseable upstream answer".to_string());
        };
        interpret_field_answer(doc, field, &answer)
    }

    async fn enrich_reviews(&self, doc: &mut CompanyDoc, budget: &Budget) -> FieldResult {
        let prompt = build_reviews_prompt(doc);
        let timeout = budget.clamp_stage_timeout(StageLimits::default());
        let text = match self.completion.chat(&prompt, timeout).await {
            Ok(text) => text,
            Err(err) => return FieldResult::Errored(err.to_string()),
        };
        let Some(items) = extract_json_array(&text) else {
            return FieldResult::Missing(MissingReason::NotFound);
        };

        let reviews = collect_reviews(&items);
        for review in &reviews {
            note_review_attempt(doc, &review.source_url, None);
        }
        let mut added = 0;
        for review in reviews {
            if doc.reviews.iter().any(|r| r.source_url == review.source_url) {
                continue;
            }
            doc.reviews.push(review);
            added += 1;
        }
        if added > 0 {
            doc.reviews_stage_status = StageStatus::Complete;
            doc.import_missing_reason.remove(EnrichField::Reviews.as_str());
            mark_field_success(doc, EnrichField::Reviews);
            FieldResult::Resolved
        } else {
            FieldResult::Missing(MissingReason::NotFound)
        }
    }

    /// Logo import runs detached from the cycle: the attempt is already
    /// recorded on the document, the task patches the outcome in with its
    /// own read-merge-write, and the receiver only signals completion.
    fn spawn_logo_task(&self, doc: &CompanyDoc) -> oneshot::Receiver<LogoImportStatus> {
        let (tx, rx) = oneshot::channel();
        let engine = Arc::clone(&self.logo);
        let store = self.store.clone();
        let cap = self.config.max_field_attempts;
        let request = LogoRequest {
            company_id: doc.id.clone(),
            domain: doc.normalized_domain.clone().unwrap_or_default(),
            website_url: doc.website_url.clone(),
            provided_source_url: None,
        };
        let company_id = doc.id.clone();

        tokio::spawn(async move {
            let budget = Budget::default_cap();
            let outcome = engine.import_logo(&budget, &request).await;

            match store.read(&company_id, None).await {
                Ok(Some(stored)) => match stored.decode::<CompanyDoc>() {
                    Ok(mut doc) => {
                        match outcome.status {
                            LogoImportStatus::Imported => {
                                doc.logo_url = outcome.logo_url.clone();
                                doc.logo_source_url = outcome.logo_source_url.clone();
                                doc.logo_stage_status = StageStatus::Complete;
                                doc.import_missing_reason.remove(EnrichField::Logo.as_str());
                                mark_field_success(&mut doc, EnrichField::Logo);
                            }
                            LogoImportStatus::Missing => {
                                record_missing(&mut doc, EnrichField::Logo, MissingReason::NotFound, cap);
                            }
                            LogoImportStatus::Failed => {
                                let err = outcome
                                    .error
                                    .clone()
                                    .unwrap_or_else(|| "logo import failed".to_string());
                                mark_field_error(&mut doc, EnrichField::Logo, &err);
                                record_missing(&mut doc, EnrichField::Logo, MissingReason::Missing, cap);
                            }
                        }
                        if let Err(err) = persist_merged(&store, &mut doc).await {
                            warn!(company_id = %doc.id, error = %err, "logo outcome write failed");
                        }
                    }
                    Err(err) => warn!(company_id, error = %err, "logo outcome decode failed"),
                },
                Ok(None) => warn!(company_id, "company vanished before logo outcome"),
                Err(err) => warn!(company_id, error = %err, "logo outcome read failed"),
            }
            let _ = tx.send(outcome.status);
        });
        rx
    }

    async fn persist(&self, doc: &mut CompanyDoc) -> Result<(), WorkerError> {
        persist_merged(&self.store, doc).await
    }

    async fn schedule_next_cycle(
        &self,
        session: &mut ImportSession,
        message: &ResumeMessage,
    ) -> bool {
        let next = ResumeMessage {
            session_id: session.session_id.clone(),
            company_ids: message.company_ids.clone(),
            reason: "cycle_continue".to_string(),
            requested_by: message.requested_by.clone(),
            enqueue_at: Utc::now().to_rfc3339(),
            cycle_count: Some(session.cycle_count),
            run_id: Some(Uuid::new_v4().to_string()),
        };
        match self.queue.enqueue_resume(next, NEXT_CYCLE_DELAY_MS).await {
            Ok(receipt) => {
                debug!(
                    session_id = %session.session_id,
                    queue = %receipt.queue,
                    cycle = session.cycle_count,
                    "next resume cycle scheduled"
                );
                true
            }
            Err(err) => {
                warn!(
                    session_id = %session.session_id,
                    error = %err,
                    "failed to schedule next resume cycle"
                );
                session.last_error = Some(format!("resume scheduling failed: {err}"));
                false
            }
        }
    }

    /// Closing pass over the session's companies. With `force`, anything
    /// still retryable is terminalized because no further cycle will run.
    /// Either way, a document left with terminal gaps is red-flagged.
    async fn finalize_companies(&self, session_id: &str, force: bool) -> Result<(), WorkerError> {
        let batch = self.store.session_companies(session_id, BATCH_LIMIT).await?;
        for stored in batch {
            let mut doc: CompanyDoc = stored.decode()?;
            let before = serde_json::to_value(&doc).ok();

            if force {
                force_terminalize_remaining(&mut doc);
            }
            let has_gap = EnrichField::ALL
                .iter()
                .any(|f| !doc.field_has_value(*f) && doc.field_terminal(*f));
            if has_gap {
                mark_enrichment_incomplete(&mut doc, "one or more fields could not be enriched", None);
            }

            let after = serde_json::to_value(&doc).ok();
            if before != after {
                doc.updated_at = Utc::now();
                self.store.upsert(&doc.id.clone(), &doc).await?;
            }
        }
        Ok(())
    }
}

/// Read-merge-write so a concurrent writer (another cycle, a detached
/// logo task) never gets clobbered by a stale in-memory copy. Shared by
/// the cycle's field persists and the logo task's outcome write.
async fn persist_merged(store: &DocumentStore, doc: &mut CompanyDoc) -> Result<(), WorkerError> {
    if let Some(current) = store.read(&doc.id, None).await? {
        let mut base: CompanyDoc = current.decode()?;
        merge_company(&mut base, doc.clone());
        *doc = base;
    }
    doc.updated_at = Utc::now();
    store.upsert(&doc.id.clone(), doc).await?;
    Ok(())
}

/// A redelivered message from an already consumed cycle must be dropped,
/// not acted on: rewinding the counter would extend the session past the
/// cycle cap.
fn message_is_stale(session_cycle: u32, message_cycle: Option<u32>) -> bool {
    message_cycle.map(|c| c < session_cycle).unwrap_or(false)
}

/// The counter only ever moves forward, whichever of the session document
/// and the message carries the larger value.
fn next_cycle_count(session_cycle: u32, message_cycle: Option<u32>) -> u32 {
    message_cycle
        .map_or(session_cycle, |c| c.max(session_cycle))
        .saturating_add(1)
}

fn company_context(doc: &CompanyDoc) -> String {
    let mut ctx = format!("Company: {}.", doc.company_name);
    if let Some(url) = doc.website_url.as_deref() {
        ctx.push_str(&format!(" Website: {url}."));
    }
    if !doc.industries.is_empty() {
        ctx.push_str(&format!(" Industries: {}.", doc.industries.join(", ")));
    }
    ctx
}

fn build_field_prompt(doc: &CompanyDoc, field: EnrichField) -> String {
    let ask = match field {
        EnrichField::Industries => {
            "List the industries this company operates in as a JSON array of short strings \
             under the key \"value\"."
        }
        EnrichField::ProductKeywords => {
            "List up to ten concrete product keywords for this company as a JSON array of \
             strings under the key \"value\"."
        }
        EnrichField::Tagline => {
            "Give this company's actual marketing tagline as a string under the key \"value\"."
        }
        EnrichField::HeadquartersLocation => {
            "Give this company's headquarters location (city, region, country) as a string \
             under the key \"value\", and the page you found it on under \"source_url\"."
        }
        EnrichField::ManufacturingLocations => {
            "List the locations where this company manufactures its products as a JSON array \
             of strings under the key \"value\", and the page you found them on under \
             \"source_url\"."
        }
        EnrichField::Reviews | EnrichField::Logo => "",
    };
    format!(
        "{}\n{ask}\nRespond with only a JSON object: {{\"status\": \"found\" | \"not_found\" | \
         \"not_disclosed\" | \"uncertain\", \"value\": ..., \"source_url\": optional string}}. \
         Use \"not_disclosed\" only when the company deliberately withholds this information. \
         Never guess.",
        company_context(doc)
    )
}

fn build_reviews_prompt(doc: &CompanyDoc) -> String {
    format!(
        "{}\nFind genuine customer or press reviews of this company. Respond with only a JSON \
         array of objects with keys \"source_url\", \"title\", \"snippet\" and \"rating\" \
         (number or null). Return an empty array if none exist. Never invent reviews.",
        company_context(doc)
    )
}

/// Apply one upstream answer to the document. Pure over the document, so
/// the classification rules are testable without a live endpoint.
fn interpret_field_answer(
    doc: &mut CompanyDoc,
    field: EnrichField,
    answer: &serde_json::Map<String, Value>,
) -> FieldResult {
    let status = answer
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_lowercase();

    match status.as_str() {
        "found" => {}
        "not_found" | "none" => return FieldResult::Missing(MissingReason::NotFound),
        "not_disclosed" => return FieldResult::Missing(MissingReason::NotDisclosed),
        "uncertain" => return FieldResult::Missing(MissingReason::NotDisclosedPending),
        other => {
            return FieldResult::Errored(format!("unrecognized upstream status '{other}'"));
        }
    }

    let value = answer.get("value").unwrap_or(&Value::Null);
    match apply_field_value(doc, field, value) {
        Ok(()) => {
            doc.set_field_unknown(field, false);
            doc.import_missing_reason.remove(field.as_str());
            mark_field_success(doc, field);
            if let Some(url) = answer.get("source_url").and_then(Value::as_str) {
                crate::services::enrichment::add_provenance(doc, field, url, "completion");
            }
            FieldResult::Resolved
        }
        Err(reason) => FieldResult::Missing(reason),
    }
}

fn string_items(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Value::String(s) if !s.trim().is_empty() => {
            s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect()
        }
        _ => Vec::new(),
    }
}

fn apply_field_value(
    doc: &mut CompanyDoc,
    field: EnrichField,
    value: &Value,
) -> Result<(), MissingReason> {
    match field {
        EnrichField::Industries => {
            let raw = string_items(value);
            if raw.is_empty() {
                return Err(MissingReason::NotFound);
            }
            let cleaned = quality::sanitize_industries(&raw);
            if cleaned.is_empty() {
                return Err(MissingReason::LowQuality);
            }
            doc.industries = cleaned;
            Ok(())
        }
        EnrichField::ProductKeywords => {
            let raw = string_items(value);
            if raw.is_empty() {
                return Err(MissingReason::NotFound);
            }
            let cleaned = quality::sanitize_keywords(&raw);
            if cleaned.is_empty() {
                return Err(MissingReason::LowQuality);
            }
            doc.product_keywords = cleaned;
            Ok(())
        }
        EnrichField::Tagline => {
            let Some(text) = value.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                return Err(MissingReason::NotFound);
            };
            if quality::is_not_disclosed_sentinel(text) {
                return Err(MissingReason::NotDisclosedPending);
            }
            if !quality::tagline_passes(text) {
                return Err(MissingReason::LowQuality);
            }
            doc.tagline = Some(text.to_string());
            Ok(())
        }
        EnrichField::HeadquartersLocation => {
            let Some(text) = value.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                return Err(MissingReason::NotFound);
            };
            if quality::is_not_disclosed_sentinel(text) {
                return Err(MissingReason::NotDisclosedPending);
            }
            let address = Address::raw_only(text);
            if !quality::address_passes(&address) {
                return Err(MissingReason::LowQuality);
            }
            doc.headquarters_location = Some(address);
            Ok(())
        }
        EnrichField::ManufacturingLocations => {
            let raw = string_items(value);
            if raw.is_empty() {
                return Err(MissingReason::NotFound);
            }
            let addresses: Vec<Address> = raw
                .iter()
                .filter(|s| !quality::is_not_disclosed_sentinel(s))
                .map(|s| Address::raw_only(s.as_str()))
                .filter(quality::address_passes)
                .collect();
            if addresses.is_empty() {
                return Err(MissingReason::LowQuality);
            }
            doc.manufacturing_locations = addresses;
            Ok(())
        }
        EnrichField::Reviews | EnrichField::Logo => Err(MissingReason::Missing),
    }
}

fn collect_reviews(items: &[Value]) -> Vec<Review> {
    let mut out: Vec<Review> = Vec::new();
    for item in items {
        let Value::Object(obj) = item else { continue };
        let Some(source_url) = obj
            .get("source_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        else {
            continue;
        };
        if !quality::provenance_url_allowed(source_url) {
            continue;
        }
        if out.iter().any(|r| r.source_url == source_url) {
            continue;
        }
        out.push(Review {
            source_url: source_url.to_string(),
            title: obj
                .get("title")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            snippet: obj
                .get("snippet")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            rating: obj.get("rating").and_then(Value::as_f64),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> CompanyDoc {
        CompanyDoc::seed(
            "sess-1",
            "acme-example-sess1".to_string(),
            "Acme".to_string(),
            Some("https://acme.example".to_string()),
            Some("acme.example".to_string()),
        )
    }

    fn answer(value: Value) -> serde_json::Map<String, Value> {
        let Value::Object(map) = value else {
            panic!("test answer must be an object")
        };
        map
    }

    #[test]
    fn found_industries_are_canonicalized_onto_the_doc() {
        let mut d = doc();
        let result = interpret_field_answer(
            &mut d,
            EnrichField::Industries,
            &answer(json!({"status": "found", "value": ["vitamins", "Oral Care"]})),
        );
        assert!(matches!(result, FieldResult::Resolved));
        assert!(d.industries.contains(&"Supplements".to_string()));
        assert!(!d.industries_unknown);
        assert!(d.missing_reason(EnrichField::Industries).is_none());
    }

    #[test]
    fn placeholder_tagline_is_low_quality_not_a_value() {
        let mut d = doc();
        let result = interpret_field_answer(
            &mut d,
            EnrichField::Tagline,
            &answer(json!({"status": "found", "value": "N/A"})),
        );
        assert!(matches!(
            result,
            FieldResult::Missing(MissingReason::LowQuality)
        ));
        assert!(d.tagline.is_none());
    }

    #[test]
    fn sentinel_value_with_found_status_is_pending_not_terminal() {
        let mut d = doc();
        let result = interpret_field_answer(
            &mut d,
            EnrichField::HeadquartersLocation,
            &answer(json!({"status": "found", "value": "Not disclosed"})),
        );
        assert!(matches!(
            result,
            FieldResult::Missing(MissingReason::NotDisclosedPending)
        ));
        assert!(d.headquarters_location.is_none());
    }

    #[test]
    fn not_disclosed_status_maps_to_terminal_reason() {
        let mut d = doc();
        let result = interpret_field_answer(
            &mut d,
            EnrichField::HeadquartersLocation,
            &answer(json!({"status": "not_disclosed"})),
        );
        assert!(matches!(
            result,
            FieldResult::Missing(MissingReason::NotDisclosed)
        ));
    }

    #[test]
    fn provenance_is_recorded_for_sourced_locations() {
        let mut d = doc();
        let result = interpret_field_answer(
            &mut d,
            EnrichField::HeadquartersLocation,
            &answer(json!({
                "status": "found",
                "value": "Austin, Texas, USA",
                "source_url": "https://acme.example/about"
            })),
        );
        assert!(matches!(result, FieldResult::Resolved));
        assert_eq!(d.location_sources.len(), 1);
        assert_eq!(d.location_sources[0].source_url, "https://acme.example/about");
    }

    #[test]
    fn unrecognized_status_is_an_error_not_a_classification() {
        let mut d = doc();
        let result = interpret_field_answer(
            &mut d,
            EnrichField::Tagline,
            &answer(json!({"status": "maybe", "value": "x"})),
        );
        assert!(matches!(result, FieldResult::Errored(_)));
    }

    #[test]
    fn reviews_require_http_urls_and_allowed_hosts() {
        let items = vec![
            json!({"source_url": "https://reviews.example/acme", "title": "Great", "rating": 4.5}),
            json!({"source_url": "ftp://bad.example/acme"}),
            json!({"source_url": "https://www.fiverr.com/acme"}),
            json!({"source_url": "https://reviews.example/acme", "title": "Duplicate"}),
            json!({"title": "no url"}),
        ];
        let reviews = collect_reviews(&items);
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].rating, Some(4.5));
    }

    #[test]
    fn stale_messages_are_detected_and_cycles_never_rewind() {
        assert!(message_is_stale(5, Some(2)));
        assert!(!message_is_stale(5, Some(5)));
        assert!(!message_is_stale(5, Some(7)));
        assert!(!message_is_stale(5, None));

        // A late message never pulls the counter backwards.
        assert_eq!(next_cycle_count(5, Some(2)), 6);
        assert_eq!(next_cycle_count(5, Some(7)), 8);
        assert_eq!(next_cycle_count(5, None), 6);
        assert_eq!(next_cycle_count(u32::MAX, None), u32::MAX);
    }

    #[test]
    fn comma_separated_strings_are_accepted_for_list_fields() {
        let mut d = doc();
        let result = interpret_field_answer(
            &mut d,
            EnrichField::ManufacturingLocations,
            &answer(json!({"status": "found", "value": "Shenzhen, China; good"})),
        );
        // A single blob string still parses into at least one address.
        assert!(matches!(result, FieldResult::Resolved));
        assert!(!d.manufacturing_locations.is_empty());
    }
}
