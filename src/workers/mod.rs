pub mod primary;
pub mod resume;

use crate::db::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no primary job found for session '{0}'")]
    JobNotFound(String),

    #[error("no session document found for '{0}'")]
    SessionNotFound(String),
}
