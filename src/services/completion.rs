use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 30_000;

/// Client for the upstream chat-style AI completion endpoint.
pub struct CompletionClient {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("upstream response had no choices")]
    EmptyResponse,

    #[error("Failed to parse completion response: {0}")]
    Parse(#[from] serde_json::Error),
}

impl CompletionError {
    /// 408/421/429 and all 5xx are worth retrying with backoff, as are
    /// plain timeouts and connection failures. Everything else is terminal
    /// for this job run.
    pub fn is_transient(&self) -> bool {
        match self {
            CompletionError::Status { status, .. } => {
                status.is_server_error()
                    || matches!(
                        *status,
                        StatusCode::REQUEST_TIMEOUT
                            | StatusCode::MISDIRECTED_REQUEST
                            | StatusCode::TOO_MANY_REQUESTS
                    )
            }
            CompletionError::Http(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}

impl CompletionClient {
    pub fn new(endpoint: String, api_key: String, model: String) -> Self {
        Self {
            http: Client::new(),
            endpoint,
            api_key,
            model,
        }
    }

    /// One chat completion with an explicit per-call timeout. The timeout
    /// always comes from the budget clock, never a literal at the call site.
    pub async fn chat(&self, prompt: &str, timeout: Duration) -> Result<String, CompletionError> {
        let request_body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.2,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&request_body)
            .send()
            .await
            .map_err(CompletionError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Status {
                status,
                body: truncate_for_log(&body, 300),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(CompletionError::Http)?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(CompletionError::EmptyResponse)
    }
}

fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

/// Exponential backoff for transient upstream failures: base 1s doubling
/// to a 30s cap, plus sub-second jitter so synchronized retries spread out.
pub fn transient_backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(10)).min(BACKOFF_CAP_MS);
    let jitter_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()) % 500)
        .unwrap_or(0);
    Duration::from_millis(exp + jitter_ms)
}

/// Extract the first JSON array embedded in free-form prose. Upstream
/// models wrap their answer in commentary often enough that strict parsing
/// is useless; this scans for a balanced bracketed span that parses.
pub fn extract_json_array(text: &str) -> Option<Vec<Value>> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(open_rel) = text[start..].find('[') {
        let open = start + open_rel;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in bytes[open..].iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'[' => depth += 1,
                b']' => {
                    depth -= 1;
                    if depth == 0 {
                        let span = &text[open..=open + i];
                        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(span) {
                            return Some(items);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        start = open + 1;
    }
    None
}

/// Same tolerance for single-object answers.
pub fn extract_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(open_rel) = text[start..].find('{') {
        let open = start + open_rel;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in bytes[open..].iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        let span = &text[open..=open + i];
                        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(span) {
                            return Some(map);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
        start = open + 1;
    }
    None
}
