//! Post-processing actions
//!
//! Each action reads a document's bytes, does its work and returns the
//! partial result for its own slot. Actions never touch the record; the
//! orchestrator merges their outcomes.

use async_trait::async_trait;
use std::sync::Arc;

use super::media::{render_text_preview, MediaTransform};
use crate::error::Result;
use crate::providers::AnalysisClient;
use crate::storage::ContentStore;
use crate::types::{ActionKind, ActionOutcome, Companion, DocumentRecord};

/// One registered post-processing step
#[async_trait]
pub trait Action: Send + Sync {
    fn kind(&self) -> ActionKind;

    async fn run(&self, record: &DocumentRecord) -> Result<ActionOutcome>;
}

/// Re-encode images in place, keeping the uploaded bytes as `_source`
pub struct OptimizeAction {
    store: Arc<ContentStore>,
    media: Arc<dyn MediaTransform>,
}

impl OptimizeAction {
    pub fn new(store: Arc<ContentStore>, media: Arc<dyn MediaTransform>) -> Self {
        Self { store, media }
    }
}

#[async_trait]
impl Action for OptimizeAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Optimize
    }

    async fn run(&self, record: &DocumentRecord) -> Result<ActionOutcome> {
        if !record.is_image() {
            return Ok(ActionOutcome::Optimized(false));
        }

        let address = record.address();
        let original = self.store.read_original(address).await?;
        let Some(optimized) = self.media.optimize_image(original, &record.facts.mime).await? else {
            tracing::debug!("No decoder for {} ({}), leaving blob as is", address, record.facts.mime);
            return Ok(ActionOutcome::Optimized(false));
        };

        self.store.preserve_original(address).await?;
        self.store.replace_blob(address, &optimized).await?;
        tracing::info!(
            "Optimized {}: {} -> {} bytes",
            address,
            record.facts.size,
            optimized.len()
        );
        Ok(ActionOutcome::Optimized(true))
    }
}

/// Write a `_preview` file for images, PDFs and text
pub struct PreviewAction {
    store: Arc<ContentStore>,
    media: Arc<dyn MediaTransform>,
    text_preview_size: u32,
}

impl PreviewAction {
    pub fn new(store: Arc<ContentStore>, media: Arc<dyn MediaTransform>, text_preview_size: u32) -> Self {
        Self {
            store,
            media,
            text_preview_size,
        }
    }

    async fn render(&self, record: &DocumentRecord) -> Result<Option<Vec<u8>>> {
        let mime = record.facts.mime.as_str();
        let original = self.store.read_original(record.address()).await?;

        if mime.starts_with("image/") {
            self.media.thumbnail(original, mime).await
        } else if mime == "application/pdf" {
            let page = self.media.rasterize_pdf(original).await?;
            self.media.thumbnail(page, "image/png").await
        } else if mime.starts_with("text/") {
            Ok(Some(render_text_preview(&original, self.text_preview_size)))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl Action for PreviewAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Preview
    }

    async fn run(&self, record: &DocumentRecord) -> Result<ActionOutcome> {
        match self.render(record).await? {
            Some(preview) => {
                self.store
                    .write_companion(record.address(), Companion::Preview, &preview)
                    .await?;
                Ok(ActionOutcome::Preview(true))
            }
            None => Ok(ActionOutcome::Preview(false)),
        }
    }
}

/// Extract structured metadata through the analysis provider
pub struct AnalyzeAction {
    store: Arc<ContentStore>,
    media: Arc<dyn MediaTransform>,
    client: Arc<AnalysisClient>,
}

impl AnalyzeAction {
    pub fn new(store: Arc<ContentStore>, media: Arc<dyn MediaTransform>, client: Arc<AnalysisClient>) -> Self {
        Self { store, media, client }
    }
}

#[async_trait]
impl Action for AnalyzeAction {
    fn kind(&self) -> ActionKind {
        ActionKind::Analyze
    }

    async fn run(&self, record: &DocumentRecord) -> Result<ActionOutcome> {
        let facts = &record.facts;
        let original = self.store.read_original(&facts.address).await?;

        // Images go out as a smaller JPEG when we can decode them.
        let (mime, bytes) = if record.is_image() {
            match self.media.recompress_for_analysis(original.clone(), &facts.mime).await? {
                Some(jpeg) => ("image/jpeg", jpeg),
                None => (facts.mime.as_str(), original),
            }
        } else {
            (facts.mime.as_str(), original)
        };

        let analysis = self.client.analyze(&facts.name, mime, &bytes).await?;
        tracing::info!("Analyzed {}: '{}' ({})", facts.address, analysis.title, analysis.doc_type);
        Ok(ActionOutcome::Analysis(analysis))
    }
}

/// The fixed set of actions every document goes through
pub struct ActionRegistry {
    actions: Vec<Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new(actions: Vec<Arc<dyn Action>>) -> Self {
        Self { actions }
    }

    /// Optimize, preview and analyze
    pub fn standard(
        store: Arc<ContentStore>,
        media: Arc<dyn MediaTransform>,
        client: Arc<AnalysisClient>,
        text_preview_size: u32,
    ) -> Self {
        Self::new(vec![
            Arc::new(OptimizeAction::new(store.clone(), media.clone())),
            Arc::new(PreviewAction::new(store.clone(), media.clone(), text_preview_size)),
            Arc::new(AnalyzeAction::new(store, media, client)),
        ])
    }

    pub fn actions(&self) -> &[Arc<dyn Action>] {
        &self.actions
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        self.actions.iter().map(|a| a.kind()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{analysis_reply, sample_analysis, stage_document, StubMedia};
    use crate::testing::ScriptedUpstream;
    use crate::processing::{RequestQueue, RetryPolicy};
    use tempfile::TempDir;

    fn store() -> (TempDir, Arc<ContentStore>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ContentStore::new(dir.path()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn test_optimize_keeps_source_copy() {
        let (_dir, store) = store();
        let record = stage_document(&store, b"raw image bytes", "photo.png", "image/png").await;
        let action = OptimizeAction::new(store.clone(), Arc::new(StubMedia::default()));

        let outcome = action.run(&record).await.unwrap();
        assert_eq!(outcome, ActionOutcome::Optimized(true));
        assert_eq!(std::fs::read(store.blob_path(record.address())).unwrap(), b"optimized");
        assert_eq!(store.read_original(record.address()).await.unwrap(), b"raw image bytes");

        // Running again starts from the preserved original.
        action.run(&record).await.unwrap();
        assert_eq!(store.read_original(record.address()).await.unwrap(), b"raw image bytes");
    }

    #[tokio::test]
    async fn test_optimize_skips_non_images() {
        let (_dir, store) = store();
        let record = stage_document(&store, b"%PDF-1.4", "doc.pdf", "application/pdf").await;
        let action = OptimizeAction::new(store.clone(), Arc::new(StubMedia::default()));

        assert_eq!(action.run(&record).await.unwrap(), ActionOutcome::Optimized(false));
        assert!(!store.companion_path(record.address(), Companion::Source).exists());
    }

    #[tokio::test]
    async fn test_preview_by_family() {
        let (_dir, store) = store();
        let action = PreviewAction::new(store.clone(), Arc::new(StubMedia::default()), 240);

        let text = stage_document(&store, b"hello\nworld", "a.txt", "text/plain").await;
        assert_eq!(action.run(&text).await.unwrap(), ActionOutcome::Preview(true));
        let svg = std::fs::read(store.companion_path(text.address(), Companion::Preview)).unwrap();
        assert!(svg.starts_with(b"<svg"));

        let pdf = stage_document(&store, b"%PDF-1.7", "b.pdf", "application/pdf").await;
        assert_eq!(action.run(&pdf).await.unwrap(), ActionOutcome::Preview(true));
        let thumb = std::fs::read(store.companion_path(pdf.address(), Companion::Preview)).unwrap();
        assert_eq!(thumb, b"thumbnail");

        let zip = stage_document(&store, b"PK", "c.zip", "application/zip").await;
        assert_eq!(action.run(&zip).await.unwrap(), ActionOutcome::Preview(false));
        assert!(!store.companion_path(zip.address(), Companion::Preview).exists());
    }

    #[tokio::test]
    async fn test_analyze_goes_through_queue() {
        let (_dir, store) = store();
        let record = stage_document(&store, b"invoice text", "inv.txt", "text/plain").await;

        let upstream = Arc::new(ScriptedUpstream::new(200).with_body(analysis_reply(&sample_analysis())));
        let (queue, _worker) = RequestQueue::spawn(upstream.clone(), RetryPolicy::default(), 4);
        let action = AnalyzeAction::new(
            store.clone(),
            Arc::new(StubMedia::default()),
            Arc::new(AnalysisClient::new(queue)),
        );

        let outcome = action.run(&record).await.unwrap();
        assert_eq!(outcome, ActionOutcome::Analysis(sample_analysis()));
        assert_eq!(upstream.call_times().len(), 1);
    }

    #[test]
    fn test_registry_kinds() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ContentStore::new(dir.path()).unwrap());
        let (queue, _rx) = RequestQueue::new(1);
        let registry = ActionRegistry::standard(
            store,
            Arc::new(StubMedia::default()),
            Arc::new(AnalysisClient::new(queue)),
            240,
        );
        assert_eq!(registry.kinds(), ActionKind::ALL.to_vec());
    }
}
