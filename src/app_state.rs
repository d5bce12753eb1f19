use std::sync::Arc;

use sqlx::PgPool;

use crate::config::AppConfig;
use crate::db::store::DocumentStore;
use crate::services::{
    completion::CompletionClient, logo::LogoEngine, queue::ResumeQueue, storage::LogoStorage,
};
use crate::workers::{primary::PrimaryWorker, resume::ResumeWorker};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: DocumentStore,
    pub queue: Arc<ResumeQueue>,
    pub completion: Arc<CompletionClient>,
    pub logo: Arc<LogoEngine>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        queue: ResumeQueue,
        completion: CompletionClient,
        storage: LogoStorage,
        config: AppConfig,
    ) -> Self {
        let storage = Arc::new(storage);
        Self {
            store: DocumentStore::new(db.clone()),
            db,
            queue: Arc::new(queue),
            completion: Arc::new(completion),
            logo: Arc::new(LogoEngine::new(storage)),
            config: Arc::new(config),
        }
    }

    pub fn primary_worker(&self) -> PrimaryWorker {
        PrimaryWorker::new(
            self.store.clone(),
            Arc::clone(&self.completion),
            Arc::clone(&self.queue),
            Arc::clone(&self.config),
        )
    }

    pub fn resume_worker(&self) -> ResumeWorker {
        ResumeWorker::new(
            self.store.clone(),
            Arc::clone(&self.completion),
            Arc::clone(&self.logo),
            Arc::clone(&self.queue),
            Arc::clone(&self.config),
        )
    }
}
