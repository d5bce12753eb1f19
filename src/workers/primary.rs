use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::store::{DocumentStore, StoreError};
use crate::models::{
    CompanyDoc, ImportJob, ImportSession, JobState, RequestPayload, JOB_PARTITION,
};
use crate::services::budget::{Budget, StageLimits};
use crate::services::completion::{
    extract_json_array, transient_backoff, CompletionClient, CompletionError,
};
use crate::services::logo::extract::normalize_domain;
use crate::services::queue::{ResumeMessage, ResumeQueue};

use super::WorkerError;

const BEACON_SEARCH_STARTED: &str = "primary_search_started";
const BEACON_EXPANDING: &str = "primary_expanding_candidates";
const BEACON_CANDIDATE_FOUND: &str = "primary_candidate_found";
const BEACON_EARLY_EXIT: &str = "primary_early_exit";
const BEACON_COMPLETE: &str = "primary_complete";
const BEACON_TIMEOUT: &str = "primary_timeout";

const ERR_PRIMARY_TIMEOUT: &str = "primary_timeout";
const ERR_NO_CANDIDATES: &str = "no_candidates_found";
const ERR_STALLED_WORKER: &str = "stalled_worker";

const DEFAULT_CANDIDATE_LIMIT: u32 = 10;
const MAX_CANDIDATE_LIMIT: u32 = 25;
const SEARCH_CALL_DESIRED_MS: u64 = 30_000;
const ERROR_PREVIEW_MAX: usize = 300;
const SINGLE_COMPANY_CALL_DESIRED_MS: u64 = 12_000;

/// What one invocation of the primary worker observed or did. A
/// non-terminal `job_state` means the search is still in progress and the
/// caller should poll again.
#[derive(Debug, Clone, Serialize)]
pub struct PrimaryRunOutcome {
    pub session_id: String,
    pub job_state: JobState,
    pub stage_beacon: String,
    /// Whether this invocation held the lease and made progress, as
    /// opposed to reporting on somebody else's run.
    pub claimed: bool,
    pub candidates_found: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PrimaryRunOutcome {
    pub fn is_running(&self) -> bool {
        !self.job_state.is_terminal()
    }

    fn observed(job: &ImportJob) -> Self {
        Self {
            session_id: job.session_id.clone(),
            job_state: job.job_state,
            stage_beacon: job.stage_beacon.clone(),
            claimed: false,
            candidates_found: job.candidates_found,
            last_error: job.last_error.clone(),
        }
    }

    fn acted(job: &ImportJob) -> Self {
        Self {
            claimed: true,
            ..Self::observed(job)
        }
    }
}

/// One parsed candidate from the upstream search answer.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedCandidate {
    pub name: String,
    pub website_url: Option<String>,
    pub normalized_domain: Option<String>,
}

/// Re-entrant primary search worker. Exactly one invocation at a time
/// makes progress on a job; the version-conditioned lease claim decides
/// which one, and everyone else reports status without side effects.
pub struct PrimaryWorker {
    store: DocumentStore,
    completion: Arc<CompletionClient>,
    queue: Arc<ResumeQueue>,
    config: Arc<AppConfig>,
}

impl PrimaryWorker {
    pub fn new(
        store: DocumentStore,
        completion: Arc<CompletionClient>,
        queue: Arc<ResumeQueue>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            completion,
            queue,
            config,
        }
    }

    pub async fn run(&self, session_id: &str) -> Result<PrimaryRunOutcome, WorkerError> {
        let job_id = ImportJob::doc_id(session_id);
        let stored = self
            .store
            .read(&job_id, None)
            .await?
            .ok_or_else(|| WorkerError::JobNotFound(session_id.to_string()))?;
        let mut job: ImportJob = stored.decode()?;
        let mut version = stored.version;
        let now = Utc::now();

        if job.job_state.is_terminal() {
            return Ok(PrimaryRunOutcome::observed(&job));
        }

        // A job nobody ever picked up still expires. Age counts from
        // creation until the first claim sets started_at.
        if job.started_at.is_none() {
            let queued_ms = now.signed_duration_since(job.created_at).num_milliseconds();
            if queued_ms > self.config.primary_hard_timeout_ms as i64 {
                job.stage_beacon = BEACON_TIMEOUT.to_string();
                self.force_error(&mut job, &mut version, ERR_PRIMARY_TIMEOUT)
                    .await?;
                return Ok(PrimaryRunOutcome::acted(&job));
            }
        }

        // Job-level watchdogs span invocations through started_at, so a job
        // abandoned mid-flight still reaches a terminal state eventually.
        if let Some(started) = job.started_at {
            let run_ms = now.signed_duration_since(started).num_milliseconds();
            if run_ms > self.config.primary_hard_timeout_ms as i64 {
                job.stage_beacon = BEACON_TIMEOUT.to_string();
                self.force_error(&mut job, &mut version, ERR_PRIMARY_TIMEOUT)
                    .await?;
                return Ok(PrimaryRunOutcome::acted(&job));
            }
            if job.candidates_found == 0 && run_ms > self.config.primary_no_candidates_ms as i64 {
                job.stage_beacon = BEACON_EXPANDING.to_string();
                self.force_error(&mut job, &mut version, ERR_NO_CANDIDATES)
                    .await?;
                return Ok(PrimaryRunOutcome::acted(&job));
            }
        }

        if job.job_state == JobState::Running {
            if job.heartbeat_stale(now, self.config.heartbeat_stale_ms) {
                self.force_error(&mut job, &mut version, ERR_STALLED_WORKER)
                    .await?;
                return Ok(PrimaryRunOutcome::acted(&job));
            }
            if !job.lease_expired(now) {
                // Someone else is actively working this job.
                return Ok(PrimaryRunOutcome::observed(&job));
            }
        }

        let worker_id = format!("primary-{}", Uuid::new_v4());
        job.job_state = JobState::Running;
        job.stage_beacon = BEACON_SEARCH_STARTED.to_string();
        job.locked_by = Some(worker_id.clone());
        job.lock_expires_at = Some(now + chrono::Duration::milliseconds(self.config.lock_ttl_ms as i64));
        job.last_heartbeat_at = Some(now);
        if job.started_at.is_none() {
            job.started_at = Some(now);
        }
        match self.save_job(&mut job, &mut version).await {
            Ok(()) => {}
            Err(StoreError::VersionConflict { .. }) => {
                debug!(session_id, "primary lease claim lost");
                // Report what the winner left behind, not our stale copy.
                if let Some(current) = self.store.read(&job_id, None).await? {
                    let job: ImportJob = current.decode()?;
                    return Ok(PrimaryRunOutcome::observed(&job));
                }
                return Err(WorkerError::JobNotFound(session_id.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        info!(session_id, worker_id = %worker_id, "primary lease claimed");

        self.search_loop(&mut job, &mut version).await?;
        Ok(PrimaryRunOutcome::acted(&job))
    }

    async fn search_loop(
        &self,
        job: &mut ImportJob,
        version: &mut i64,
    ) -> Result<(), WorkerError> {
        let budget = Budget::start(self.config.primary_hard_timeout_ms, None);
        let single = job.request_payload.single_company();
        let prompt = build_search_prompt(&job.request_payload);
        let limits = StageLimits {
            desired_ms: if single {
                SINGLE_COMPANY_CALL_DESIRED_MS
            } else {
                SEARCH_CALL_DESIRED_MS
            },
            min_ms: 1_000,
            max_ms: 60_000,
            safety_margin_ms: 1_200,
        };

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let started = job.started_at.unwrap_or_else(Utc::now);
            let run_ms = Utc::now().signed_duration_since(started).num_milliseconds();
            if run_ms > self.config.primary_hard_timeout_ms as i64 || budget.expired() {
                job.stage_beacon = BEACON_TIMEOUT.to_string();
                self.force_error(job, version, ERR_PRIMARY_TIMEOUT).await?;
                return Ok(());
            }
            if job.candidates_found == 0 && run_ms > self.config.primary_no_candidates_ms as i64 {
                job.stage_beacon = BEACON_EXPANDING.to_string();
                self.force_error(job, version, ERR_NO_CANDIDATES).await?;
                return Ok(());
            }

            if !self.heartbeat(job, version).await? {
                return Ok(());
            }
            let timeout = budget.clamp_stage_timeout(limits);
            job.upstream_calls_made += 1;
            let answer = self.completion.chat(&prompt, timeout).await;
            if !self.heartbeat(job, version).await? {
                return Ok(());
            }

            match answer {
                Ok(text) => {
                    let candidates = parse_candidates(&text, candidate_limit(&job.request_payload));
                    if candidates.is_empty() {
                        warn!(
                            session_id = %job.session_id,
                            attempt,
                            "upstream answer contained no usable candidates"
                        );
                        job.stage_beacon = BEACON_EXPANDING.to_string();
                        job.last_error = Some(ERR_NO_CANDIDATES.to_string());
                        if !self.try_save(job, version).await? {
                            return Ok(());
                        }
                        if attempt >= self.config.primary_max_attempts {
                            self.force_error(job, version, ERR_NO_CANDIDATES).await?;
                            return Ok(());
                        }
                        tokio::time::sleep(bounded_backoff(attempt, &budget)).await;
                        continue;
                    }

                    job.stage_beacon = BEACON_CANDIDATE_FOUND.to_string();
                    job.last_error = None;
                    if !self.try_save(job, version).await? {
                        return Ok(());
                    }
                    self.complete(job, version, candidates, single).await?;
                    return Ok(());
                }
                Err(err) => {
                    let transient = err.is_transient();
                    job.last_error = Some(describe_completion_error(&err));
                    warn!(
                        session_id = %job.session_id,
                        attempt,
                        transient,
                        error = %err,
                        "primary search call failed"
                    );
                    let will_retry = transient
                        && attempt < self.config.primary_max_attempts
                        && !budget.expired();
                    if !will_retry {
                        job.job_state = JobState::Error;
                        job.locked_by = None;
                        job.lock_expires_at = None;
                        self.try_save(job, version).await?;
                        return Ok(());
                    }
                    if !self.try_save(job, version).await? {
                        return Ok(());
                    }
                    tokio::time::sleep(bounded_backoff(attempt, &budget)).await;
                }
            }
        }
    }

    /// Persist candidates as seed documents and close out the job. In
    /// single-company mode the first candidate wins and the rest are
    /// dropped on the floor.
    async fn complete(
        &self,
        job: &mut ImportJob,
        version: &mut i64,
        candidates: Vec<SeedCandidate>,
        single: bool,
    ) -> Result<(), WorkerError> {
        let take = if single { 1 } else { candidates.len() };
        let mut seeded: u32 = 0;

        for candidate in candidates.into_iter().take(take) {
            let id = company_doc_id(&job.session_id, &candidate);
            // Re-entry must not clobber a document an earlier run already
            // seeded (and the resume worker may have started enriching).
            if self.store.read(&id, None).await?.is_some() {
                seeded += 1;
                continue;
            }
            let doc = CompanyDoc::seed(
                &job.session_id,
                id,
                candidate.name,
                candidate.website_url,
                candidate.normalized_domain,
            );
            self.store.upsert(&doc.id, &doc).await?;
            seeded += 1;
        }

        job.candidates_found = seeded;
        job.early_exit_triggered = single;
        job.stage_beacon = if single {
            BEACON_EARLY_EXIT.to_string()
        } else {
            BEACON_COMPLETE.to_string()
        };
        job.job_state = JobState::Complete;
        job.locked_by = None;
        job.lock_expires_at = None;
        job.last_error = None;
        self.save_job(job, version).await?;
        info!(
            session_id = %job.session_id,
            seeded,
            early_exit = single,
            "primary search complete"
        );
        metrics::counter!("import_primary_completed_total").increment(1);

        self.update_session(job, seeded).await?;
        self.schedule_resume(job).await;
        Ok(())
    }

    async fn update_session(&self, job: &ImportJob, seeded: u32) -> Result<(), WorkerError> {
        let session_id = ImportSession::doc_id(&job.session_id);
        let Some(stored) = self.store.read(&session_id, None).await? else {
            warn!(session_id = %job.session_id, "session document missing at primary completion");
            return Ok(());
        };
        let mut session: ImportSession = stored.decode()?;
        session.companies_count = seeded;
        session.updated_at = Utc::now();
        self.store.upsert(&session.id, &session).await?;
        Ok(())
    }

    /// Scheduling failures are recorded, never fatal: the job itself
    /// completed and a later manual resume can still pick the session up.
    async fn schedule_resume(&self, job: &ImportJob) {
        let message = ResumeMessage {
            session_id: job.session_id.clone(),
            company_ids: None,
            reason: "primary_complete".to_string(),
            requested_by: job
                .request_payload
                .requested_by
                .clone()
                .unwrap_or_else(|| "system".to_string()),
            enqueue_at: Utc::now().to_rfc3339(),
            cycle_count: Some(0),
            run_id: Some(Uuid::new_v4().to_string()),
        };
        if let Err(err) = self.queue.enqueue_resume(message, 0).await {
            warn!(
                session_id = %job.session_id,
                error = %err,
                "failed to schedule resume cycle"
            );
        }
    }

    /// Renew the lease. A version conflict means another invocation
    /// force-errored this job out from under us; the only correct move is
    /// to stop touching it, reported as `Ok(false)`.
    async fn heartbeat(&self, job: &mut ImportJob, version: &mut i64) -> Result<bool, WorkerError> {
        let now = Utc::now();
        job.last_heartbeat_at = Some(now);
        job.lock_expires_at =
            Some(now + chrono::Duration::milliseconds(self.config.lock_ttl_ms as i64));
        match self.save_job(job, version).await {
            Ok(()) => Ok(true),
            Err(StoreError::VersionConflict { .. }) => {
                warn!(session_id = %job.session_id, "primary lease lost mid-run");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn force_error(
        &self,
        job: &mut ImportJob,
        version: &mut i64,
        code: &str,
    ) -> Result<(), WorkerError> {
        job.job_state = JobState::Error;
        job.last_error = Some(code.to_string());
        job.locked_by = None;
        job.lock_expires_at = None;
        warn!(session_id = %job.session_id, code, "primary job force-errored");
        metrics::counter!("import_primary_errors_total", "code" => code.to_string()).increment(1);
        self.try_save(job, version).await?;
        Ok(())
    }

    /// Save that tolerates losing the lease: `Ok(false)` means another
    /// invocation moved the job and this one must stop writing.
    async fn try_save(&self, job: &mut ImportJob, version: &mut i64) -> Result<bool, WorkerError> {
        match self.save_job(job, version).await {
            Ok(()) => Ok(true),
            Err(StoreError::VersionConflict { .. }) => {
                warn!(session_id = %job.session_id, "primary job changed concurrently, yielding");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn save_job(&self, job: &mut ImportJob, version: &mut i64) -> Result<(), StoreError> {
        job.updated_at = Utc::now();
        let stored = self
            .store
            .replace_if_version(JOB_PARTITION, &job.id, job, *version)
            .await?;
        *version = stored.version;
        Ok(())
    }
}

fn candidate_limit(payload: &RequestPayload) -> u32 {
    payload
        .limit
        .unwrap_or(DEFAULT_CANDIDATE_LIMIT)
        .clamp(1, MAX_CANDIDATE_LIMIT)
}

fn bounded_backoff(attempt: u32, budget: &Budget) -> Duration {
    transient_backoff(attempt.saturating_sub(1)).min(Duration::from_millis(budget.remaining_ms()))
}

fn describe_completion_error(err: &CompletionError) -> String {
    match err {
        CompletionError::Status { status, .. } => format!("upstream status {status}"),
        other => redact_error(&other.to_string()),
    }
}

/// Errors stored on job documents must not leak URL query strings or
/// fragments (they can carry keys), and stay short enough to read.
fn redact_error(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(ERROR_PREVIEW_MAX));
    for (i, token) in raw.split_whitespace().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        if token.starts_with("http://") || token.starts_with("https://") {
            out.push_str(token.split(['?', '#']).next().unwrap_or(token));
        } else {
            out.push_str(token);
        }
    }
    if out.len() > ERROR_PREVIEW_MAX {
        let mut end = ERROR_PREVIEW_MAX;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
        out.push_str("...");
    }
    out
}

fn build_search_prompt(payload: &RequestPayload) -> String {
    let limit = candidate_limit(payload);
    let mut prompt = format!(
        "Find up to {limit} real companies matching this query: {}.\n",
        payload.query.trim()
    );
    if let Some(url) = payload.website_url.as_deref() {
        if !url.trim().is_empty() {
            prompt.push_str(&format!("The company of interest operates {}.\n", url.trim()));
        }
    }
    prompt.push_str(
        "Respond with only a JSON array. Each element must be an object with \
         keys \"name\" and \"website_url\". Use null for an unknown website. \
         Do not invent companies.",
    );
    prompt
}

/// Parse the upstream answer into deduplicated seed candidates. Accepts
/// the handful of key spellings models actually produce.
pub fn parse_candidates(text: &str, limit: u32) -> Vec<SeedCandidate> {
    let Some(items) = extract_json_array(text) else {
        return Vec::new();
    };

    let mut out: Vec<SeedCandidate> = Vec::new();
    for item in items {
        let Value::Object(obj) = item else { continue };
        let name = string_field(&obj, &["name", "company_name", "company"]);
        let Some(name) = name else { continue };

        let website_url = string_field(&obj, &["website_url", "website", "url", "domain"])
            .map(|u| ensure_scheme(&u));
        let normalized_domain = website_url
            .as_deref()
            .map(normalize_domain)
            .filter(|d| !d.is_empty());

        let duplicate = out.iter().any(|c| {
            (normalized_domain.is_some() && c.normalized_domain == normalized_domain)
                || c.name.eq_ignore_ascii_case(&name)
        });
        if duplicate {
            continue;
        }
        out.push(SeedCandidate {
            name,
            website_url,
            normalized_domain,
        });
        if out.len() >= limit as usize {
            break;
        }
    }
    out
}

fn string_field(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(Value::String(s)) = obj.get(*key) {
            let s = s.trim();
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

fn ensure_scheme(url: &str) -> String {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

/// Deterministic per-session company id, so a re-entered worker seeds the
/// same document instead of a duplicate.
pub fn company_doc_id(session_id: &str, candidate: &SeedCandidate) -> String {
    let base = candidate
        .normalized_domain
        .clone()
        .unwrap_or_else(|| candidate.name.clone());
    let slug: String = base
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    let suffix: String = session_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("{slug}-{suffix}")
}
