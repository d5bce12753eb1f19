use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a primary search job. Terminal once `Complete` or `Error`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Complete,
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Error)
    }
}

/// What the client originally asked for. Carried on the job so every
/// re-entry of the worker sees the same request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

impl RequestPayload {
    /// Single-company mode: the caller wants exactly one candidate, so the
    /// first parsed result completes the job early.
    pub fn single_company(&self) -> bool {
        self.limit == Some(1)
    }
}

/// Primary search job document. One per session, addressed under the
/// "import" partition. Mutated only by the worker holding the lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: String,
    pub partition_key: String,
    pub session_id: String,
    pub job_state: JobState,
    /// Last stage the worker reached, for diagnostics and early-exit marking.
    pub stage_beacon: String,
    pub request_payload: RequestPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub upstream_calls_made: u32,
    #[serde(default)]
    pub candidates_found: u32,
    #[serde(default)]
    pub early_exit_triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const JOB_PARTITION: &str = "import";

impl ImportJob {
    pub fn doc_id(session_id: &str) -> String {
        format!("_import_primary_job_{session_id}")
    }

    pub fn new(session_id: &str, request_payload: RequestPayload) -> Self {
        let now = Utc::now();
        Self {
            id: Self::doc_id(session_id),
            partition_key: JOB_PARTITION.to_string(),
            session_id: session_id.to_string(),
            job_state: JobState::Queued,
            stage_beacon: "created".to_string(),
            request_payload,
            locked_by: None,
            lock_expires_at: None,
            last_heartbeat_at: None,
            started_at: None,
            upstream_calls_made: 0,
            candidates_found: 0,
            early_exit_triggered: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `owner` currently holds a non-expired lease on this job.
    pub fn lease_held_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.locked_by.as_deref() == Some(owner)
            && self.lock_expires_at.map(|exp| exp > now).unwrap_or(false)
    }

    /// A lease nobody can act on anymore: either never taken or expired.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lock_expires_at.map(|exp| exp <= now).unwrap_or(true)
    }

    pub fn heartbeat_stale(&self, now: DateTime<Utc>, threshold_ms: u64) -> bool {
        match self.last_heartbeat_at {
            Some(beat) => {
                let age = now.signed_duration_since(beat);
                age.num_milliseconds() > threshold_ms as i64
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn payload() -> RequestPayload {
        RequestPayload {
            query: "acme widgets".to_string(),
            website_url: None,
            limit: None,
            requested_by: None,
        }
    }

    #[test]
    fn new_job_starts_queued_and_unleased() {
        let job = ImportJob::new("sess-1", payload());
        assert_eq!(job.id, "_import_primary_job_sess-1");
        assert_eq!(job.job_state, JobState::Queued);
        assert!(job.lease_expired(Utc::now()));
    }

    #[test]
    fn lease_holder_must_match_and_be_unexpired() {
        let mut job = ImportJob::new("sess-1", payload());
        let now = Utc::now();
        job.locked_by = Some("worker-a".to_string());
        job.lock_expires_at = Some(now + Duration::minutes(5));

        assert!(job.lease_held_by("worker-a", now));
        assert!(!job.lease_held_by("worker-b", now));
        assert!(!job.lease_held_by("worker-a", now + Duration::minutes(10)));
    }

    #[test]
    fn heartbeat_staleness_uses_threshold() {
        let mut job = ImportJob::new("sess-1", payload());
        let now = Utc::now();
        job.last_heartbeat_at = Some(now - Duration::seconds(400));

        assert!(job.heartbeat_stale(now, 330_000));
        assert!(!job.heartbeat_stale(now, 500_000));
    }

    #[test]
    fn single_company_mode_requires_limit_one() {
        let mut p = payload();
        assert!(!p.single_company());
        p.limit = Some(1);
        assert!(p.single_company());
        p.limit = Some(5);
        assert!(!p.single_company());
    }
}
