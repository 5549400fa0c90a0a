//! Application state for the docshelf server

use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::DocshelfConfig;
use crate::error::Result;
use crate::ingestion::Intake;
use crate::processing::{
    ActionRegistry, MediaLimits, Orchestrator, RequestQueue, StandardMedia,
};
use crate::providers::{AnalysisClient, GeminiUpstream, MeilisearchMirror, SearchMirror};
use crate::storage::{ContentStore, DocumentRepository, PendingSet};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// Configuration
    config: DocshelfConfig,
    /// Blob store and sidecar cache
    repository: Arc<DocumentRepository>,
    /// Documents owed a pipeline run
    pending: PendingSet,
    /// Search index mirror
    mirror: Arc<dyn SearchMirror>,
    /// Action pipeline runner
    orchestrator: Arc<Orchestrator>,
    /// Upload admission and deletion
    intake: Intake,
    /// Set once startup recovery has scheduled every pending document
    ready: RwLock<bool>,
}

impl AppState {
    /// Create application state wired to the configured services
    pub async fn new(config: DocshelfConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            "Initializing docshelf state (data dir: {})",
            config.storage.data_dir.display()
        );

        let store = Arc::new(ContentStore::new(&config.storage.data_dir)?);
        let repository = Arc::new(DocumentRepository::new(store.clone()));
        let pending = PendingSet::open(config.storage.pending_db_path())?;
        tracing::info!("Pending set opened ({} entries)", pending.len()?);

        let meilisearch = MeilisearchMirror::new(&config.search)?;
        if let Err(e) = meilisearch.ensure_index().await {
            tracing::warn!("Could not confirm search index '{}': {}", config.search.index, e);
        }
        let mirror: Arc<dyn SearchMirror> = Arc::new(meilisearch);

        let upstream = Arc::new(GeminiUpstream::new(&config.analysis)?);
        let (queue, _worker) = RequestQueue::spawn(
            upstream,
            config.analysis.retry_policy(),
            config.analysis.queue_capacity,
        );
        let client = Arc::new(AnalysisClient::new(queue));

        let media = StandardMedia::new(MediaLimits::from(&config.processing));
        if !media.has_pdftoppm() {
            tracing::warn!("pdftoppm not found, PDF previews will fail");
        }
        let registry = Arc::new(ActionRegistry::standard(
            store,
            Arc::new(media),
            client,
            config.processing.thumbnail_size,
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            repository.clone(),
            pending.clone(),
            registry,
            mirror.clone(),
            config.processing.job_history,
        ));

        Ok(Self::from_parts(config, repository, pending, mirror, orchestrator))
    }

    /// Assemble state from already-built components
    pub fn from_parts(
        config: DocshelfConfig,
        repository: Arc<DocumentRepository>,
        pending: PendingSet,
        mirror: Arc<dyn SearchMirror>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        let intake = Intake::new(
            repository.clone(),
            pending.clone(),
            mirror.clone(),
            orchestrator.clone(),
        );
        Self {
            inner: Arc::new(AppStateInner {
                config,
                repository,
                pending,
                mirror,
                orchestrator,
                intake,
                ready: RwLock::new(false),
            }),
        }
    }

    /// Schedule every document left pending by a previous run, then mark
    /// the state ready
    pub fn recover(&self) -> Result<usize> {
        let batch = self.inner.config.processing.pending_scan_batch;
        let scheduled = self.inner.orchestrator.recover(batch)?.len();
        *self.inner.ready.write() = true;
        Ok(scheduled)
    }

    pub fn config(&self) -> &DocshelfConfig {
        &self.inner.config
    }

    pub fn repository(&self) -> &Arc<DocumentRepository> {
        &self.inner.repository
    }

    pub fn pending(&self) -> &PendingSet {
        &self.inner.pending
    }

    pub fn mirror(&self) -> &Arc<dyn SearchMirror> {
        &self.inner.mirror
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.inner.orchestrator
    }

    pub fn intake(&self) -> &Intake {
        &self.inner.intake
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.read()
    }
}
