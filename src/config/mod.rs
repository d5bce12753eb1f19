use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string for the partitioned document store
    pub database_url: String,

    /// Redis connection string for the resume queue
    pub redis_url: String,

    /// Upstream AI completion endpoint (chat-style, POST)
    pub completion_endpoint: String,

    /// Bearer token for the completion endpoint
    pub completion_api_key: String,

    /// Default completion model name
    #[serde(default = "default_completion_model")]
    pub completion_model: String,

    /// Object storage bucket for imported logos
    pub logo_bucket: String,

    /// Object storage access key ID (S3-compatible)
    pub logo_access_key: String,

    /// Object storage secret access key
    pub logo_secret_key: String,

    /// Object storage endpoint URL
    pub logo_endpoint: String,

    /// Public base URL under which uploaded logos are served
    #[serde(default)]
    pub logo_public_base_url: String,

    /// Well-known resume queue name
    #[serde(default = "default_resume_queue")]
    pub resume_queue_name: String,

    /// Hard ceiling for a primary search job, milliseconds
    #[serde(default = "default_primary_hard_timeout_ms")]
    pub primary_hard_timeout_ms: u64,

    /// Abort a primary job that has produced zero candidates after this
    /// long, well inside the hard ceiling
    #[serde(default = "default_primary_no_candidates_ms")]
    pub primary_no_candidates_ms: u64,

    /// Max upstream attempts per primary job invocation
    #[serde(default = "default_primary_max_attempts")]
    pub primary_max_attempts: u32,

    /// Job lease TTL, milliseconds
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// Heartbeat staleness threshold before a running job is force-errored
    #[serde(default = "default_heartbeat_stale_ms")]
    pub heartbeat_stale_ms: u64,

    /// Cap on resume cycles per session
    #[serde(default = "default_max_resume_cycles")]
    pub max_resume_cycles: u32,

    /// Per-field enrichment attempt cap
    #[serde(default = "default_max_field_attempts")]
    pub max_field_attempts: u32,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_completion_model() -> String {
    "grok-4-latest".to_string()
}

fn default_resume_queue() -> String {
    "import-resume-worker".to_string()
}

fn default_primary_hard_timeout_ms() -> u64 {
    300_000
}

fn default_primary_no_candidates_ms() -> u64 {
    120_000
}

fn default_primary_max_attempts() -> u32 {
    5
}

fn default_lock_ttl_ms() -> u64 {
    360_000
}

fn default_heartbeat_stale_ms() -> u64 {
    330_000
}

fn default_max_resume_cycles() -> u32 {
    10
}

fn default_max_field_attempts() -> u32 {
    3
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
