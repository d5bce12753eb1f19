use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};

use super::partition::{partition_key_candidates, DEFAULT_PK_PATH};

const UPSERT_TRANSIENT_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 200;

/// A document as stored, with the bookkeeping needed for conditional writes.
#[derive(Debug, Clone)]
pub struct StoredDoc {
    pub partition_key: String,
    pub id: String,
    pub body: Value,
    pub version: i64,
}

impl StoredDoc {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.body.clone()).map_err(StoreError::Decode)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("document encode error: {0}")]
    Encode(serde_json::Error),

    #[error("document decode error: {0}")]
    Decode(serde_json::Error),

    #[error("no partition-key candidate matched for '{id}' ({tried} tried)")]
    CandidatesExhausted { id: String, tried: usize },

    #[error("conditional write lost: version changed for '{id}'")]
    VersionConflict { id: String },
}

impl StoreError {
    /// Transient store failures are retried in place; everything else
    /// falls through to the next partition-key candidate or the caller.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlx(sqlx::Error::PoolTimedOut) => true,
            StoreError::Sqlx(sqlx::Error::Io(_)) => true,
            StoreError::Sqlx(sqlx::Error::Database(db)) => {
                // serialization_failure / deadlock_detected
                matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
            }
            _ => false,
        }
    }
}

/// Read/write adapter over the partitioned `documents` table. Addressing
/// requires the exact partition key; when the true key is unknown the
/// adapter walks an ordered candidate list until one succeeds.
#[derive(Clone)]
pub struct DocumentStore {
    pool: PgPool,
    pk_path: String,
}

impl DocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            pk_path: DEFAULT_PK_PATH.to_string(),
        }
    }

    /// Read a document by id, trying each plausible partition key. The
    /// optional `candidate_doc` seeds the key list for legacy documents.
    pub async fn read(
        &self,
        id: &str,
        candidate_doc: Option<&Value>,
    ) -> Result<Option<StoredDoc>, StoreError> {
        let candidates = partition_key_candidates(candidate_doc, &self.pk_path, id);
        for pk in &candidates {
            if let Some(doc) = self.read_exact(pk, id).await? {
                return Ok(Some(doc));
            }
        }
        // Last resort: the key really is unknown. This is a point read by
        // id across partitions, acceptable because ids are globally unique
        // in this system.
        let row = sqlx::query(
            "SELECT partition_key, id, body, version FROM documents WHERE id = $1 LIMIT 1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_doc).transpose()?)
    }

    async fn read_exact(&self, partition_key: &str, id: &str) -> Result<Option<StoredDoc>, StoreError> {
        let row = sqlx::query(
            "SELECT partition_key, id, body, version FROM documents \
             WHERE partition_key = $1 AND id = $2",
        )
        .bind(partition_key)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(row_to_doc).transpose()?)
    }

    /// Upsert a document, retrying transient store errors in place and
    /// falling through partition-key candidates on anything else. Never
    /// panics past this boundary; every failure is a typed error.
    pub async fn upsert<T: Serialize>(&self, id: &str, doc: &T) -> Result<StoredDoc, StoreError> {
        let body = serde_json::to_value(doc).map_err(StoreError::Encode)?;
        let candidates = partition_key_candidates(Some(&body), &self.pk_path, id);
        let tried = candidates.len();

        let mut last_err: Option<StoreError> = None;
        for pk in candidates {
            match self.upsert_with_retry(&pk, id, &body).await {
                Ok(stored) => return Ok(stored),
                Err(err) => {
                    debug!(id, partition_key = %pk, error = %err, "upsert candidate failed");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or(StoreError::CandidatesExhausted {
            id: id.to_string(),
            tried,
        }))
    }

    async fn upsert_with_retry(
        &self,
        partition_key: &str,
        id: &str,
        body: &Value,
    ) -> Result<StoredDoc, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.upsert_exact(partition_key, id, body).await {
                Ok(doc) => return Ok(doc),
                Err(err) if err.is_transient() && attempt < UPSERT_TRANSIENT_RETRIES => {
                    warn!(id, attempt, error = %err, "transient store error, retrying");
                    tokio::time::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS * attempt as u64))
                        .await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn upsert_exact(
        &self,
        partition_key: &str,
        id: &str,
        body: &Value,
    ) -> Result<StoredDoc, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO documents (partition_key, id, body, version, updated_at)
            VALUES ($1, $2, $3, 1, now())
            ON CONFLICT (partition_key, id)
            DO UPDATE SET body = EXCLUDED.body,
                          version = documents.version + 1,
                          updated_at = now()
            RETURNING partition_key, id, body, version
            "#,
        )
        .bind(partition_key)
        .bind(id)
        .bind(body)
        .fetch_one(&self.pool)
        .await?;
        row_to_doc(row)
    }

    /// Replace a document only if its version is unchanged. This is the
    /// mutual-exclusion primitive behind job lease claims: the loser of a
    /// concurrent claim sees `VersionConflict` and must back off.
    pub async fn replace_if_version<T: Serialize>(
        &self,
        partition_key: &str,
        id: &str,
        doc: &T,
        expected_version: i64,
    ) -> Result<StoredDoc, StoreError> {
        let body = serde_json::to_value(doc).map_err(StoreError::Encode)?;
        let row = sqlx::query(
            r#"
            UPDATE documents
            SET body = $3, version = version + 1, updated_at = now()
            WHERE partition_key = $1 AND id = $2 AND version = $4
            RETURNING partition_key, id, body, version
            "#,
        )
        .bind(partition_key)
        .bind(id)
        .bind(&body)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_doc(row),
            None => Err(StoreError::VersionConflict { id: id.to_string() }),
        }
    }

    /// Whether a document with this id exists anywhere (used for stop flags).
    pub async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS one FROM documents WHERE id = $1 LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Company documents belonging to a session, oldest first, capped.
    /// Control artifacts (ids prefixed `_import_`) are excluded.
    pub async fn session_companies(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<StoredDoc>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT partition_key, id, body, version
            FROM documents
            WHERE body ->> 'session_id' = $1
              AND id NOT LIKE '\_import\_%'
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_doc).collect()
    }

    pub async fn delete(&self, partition_key: &str, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM documents WHERE partition_key = $1 AND id = $2")
            .bind(partition_key)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn row_to_doc(row: sqlx::postgres::PgRow) -> Result<StoredDoc, StoreError> {
    Ok(StoredDoc {
        partition_key: row.try_get("partition_key")?,
        id: row.try_get("id")?,
        body: row.try_get("body")?,
        version: row.try_get("version")?,
    })
}
