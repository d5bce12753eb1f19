use chrono::Utc;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

const MAX_DELAY_MS: u64 = 7 * 24 * 60 * 60 * 1000;
const MAX_COMPANY_IDS: usize = 50;
const MAX_QUEUE_NAME_LEN: usize = 63;

/// Resumption message. Idempotency is the caller's concern via
/// `(session_id, cycle_count)`; the queue does not deduplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeMessage {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company_ids: Option<Vec<String>>,
    pub reason: String,
    pub requested_by: String,
    pub enqueue_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnqueueReceipt {
    pub queue: String,
    pub visible_at_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("queue misconfigured: {0}")]
    Misconfigured(&'static str),
}

/// Redis-backed delayed queue for resume-worker messages. A sorted set
/// holds payloads scored by their visibility time; consumers pop members
/// whose score has passed.
pub struct ResumeQueue {
    client: redis::Client,
    queue_key: String,
}

/// Queue names are normalized the way queue providers require: lowercase
/// alphanumerics and hyphens, trimmed, capped at 63 characters.
pub fn sanitize_queue_name(raw: &str) -> String {
    let mut name: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    while name.starts_with('-') {
        name.remove(0);
    }
    while name.ends_with('-') {
        name.pop();
    }
    name.truncate(MAX_QUEUE_NAME_LEN);
    name
}

/// Visibility delay clamped to [0, 7 days].
pub fn clamp_delay_ms(requested: i64) -> u64 {
    if requested <= 0 {
        0
    } else {
        (requested as u64).min(MAX_DELAY_MS)
    }
}

impl ResumeQueue {
    pub fn new(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let name = sanitize_queue_name(queue_name);
        if name.is_empty() {
            return Err(QueueError::Misconfigured("empty queue name"));
        }
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            queue_key: format!("enrich:queue:{name}"),
        })
    }

    /// Publish a resumption message with a visibility delay. Failures come
    /// back as typed errors so the caller can record "resumption could not
    /// be scheduled" without aborting the invocation.
    pub async fn enqueue_resume(
        &self,
        mut message: ResumeMessage,
        run_after_ms: i64,
    ) -> Result<EnqueueReceipt, QueueError> {
        if message.session_id.trim().is_empty() {
            return Err(QueueError::Misconfigured("missing session_id"));
        }
        if message.reason.trim().is_empty() {
            message.reason = "unspecified".to_string();
        }
        if message.requested_by.trim().is_empty() {
            message.requested_by = "system".to_string();
        }
        if let Some(ids) = message.company_ids.take() {
            let mut deduped: Vec<String> = Vec::new();
            for id in ids {
                let id = id.trim().to_string();
                if !id.is_empty() && !deduped.contains(&id) {
                    deduped.push(id);
                }
                if deduped.len() >= MAX_COMPANY_IDS {
                    break;
                }
            }
            if !deduped.is_empty() {
                message.company_ids = Some(deduped);
            }
        }

        let visible_at_ms = Utc::now().timestamp_millis() as u64 + clamp_delay_ms(run_after_ms);
        let payload = serde_json::to_string(&message)?;

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.zadd::<_, _, _, ()>(&self.queue_key, &payload, visible_at_ms)
            .await?;

        Ok(EnqueueReceipt {
            queue: self.queue_key.clone(),
            visible_at_ms,
        })
    }

    /// Pop one message whose visibility time has passed. The ZREM result
    /// arbitrates between concurrent consumers; only the remover that
    /// deleted the member owns the message.
    pub async fn dequeue_due(&self) -> Result<Option<ResumeMessage>, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.queue_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await?;

        let Some(payload) = due.into_iter().next() else {
            return Ok(None);
        };

        let removed: u64 = conn.zrem(&self.queue_key, &payload).await?;
        if removed == 0 {
            // Another consumer claimed it first.
            return Ok(None);
        }
        let message: ResumeMessage = serde_json::from_str(&payload)?;
        Ok(Some(message))
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await?;
        Ok(())
    }

    /// Pending messages, visible or not.
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let depth: u64 = conn.zcard(&self.queue_key).await?;
        Ok(depth)
    }
}
