use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Complete,
    Stopped,
    Error,
}

/// Control document for one import session, addressed under the "import"
/// partition alongside the primary job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSession {
    pub id: String,
    pub partition_key: String,
    pub session_id: String,
    pub status: SessionStatus,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website_url: Option<String>,
    #[serde(default)]
    pub single_company: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    /// Number of resume cycles consumed so far.
    #[serde(default)]
    pub cycle_count: u32,
    #[serde(default)]
    pub companies_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportSession {
    pub fn doc_id(session_id: &str) -> String {
        format!("_import_session_{session_id}")
    }

    /// Id of the cooperative stop flag document. Its existence means the
    /// user asked for the session to halt.
    pub fn stop_flag_id(session_id: &str) -> String {
        format!("_import_stop_{session_id}")
    }

    pub fn new(
        session_id: &str,
        query: String,
        website_url: Option<String>,
        single_company: bool,
        requested_by: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Self::doc_id(session_id),
            partition_key: super::job::JOB_PARTITION.to_string(),
            session_id: session_id.to_string(),
            status: SessionStatus::Running,
            query,
            website_url,
            single_company,
            requested_by,
            cycle_count: 0,
            companies_count: 0,
            locked_by: None,
            lock_expires_at: None,
            last_heartbeat_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, SessionStatus::Running)
    }

    /// A lease nobody can act on anymore: either never taken or expired.
    /// Same single-writer model as the primary job.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lock_expires_at.map(|exp| exp <= now).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_doc_ids_embed_session() {
        assert_eq!(ImportSession::doc_id("abc"), "_import_session_abc");
        assert_eq!(ImportSession::stop_flag_id("abc"), "_import_stop_abc");
    }

    #[test]
    fn new_session_is_running() {
        let s = ImportSession::new("abc", "q".to_string(), None, false, None);
        assert_eq!(s.status, SessionStatus::Running);
        assert!(!s.is_terminal());
    }

    #[test]
    fn new_session_lease_is_claimable() {
        let s = ImportSession::new("abc", "q".to_string(), None, false, None);
        assert!(s.lease_expired(Utc::now()));
    }

    #[test]
    fn held_lease_blocks_until_expiry() {
        let mut s = ImportSession::new("abc", "q".to_string(), None, false, None);
        let now = Utc::now();
        s.locked_by = Some("resume-a".to_string());
        s.lock_expires_at = Some(now + chrono::Duration::minutes(5));

        assert!(!s.lease_expired(now));
        assert!(s.lease_expired(now + chrono::Duration::minutes(10)));
    }
}
