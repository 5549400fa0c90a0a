//! In-process stand-ins for the external services, shared by unit tests

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{stream, Stream};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::config::DocshelfConfig;
use crate::error::Result;
use crate::ingestion::Intake;
use crate::processing::{
    Action, ActionRegistry, MediaTransform, Orchestrator, RequestQueue, RetryPolicy, Upstream,
    UpstreamReply,
};
use crate::providers::{AnalysisClient, IndexDocument, SearchMirror};
use crate::server::{build_router, state::AppState};
use crate::storage::{ContentStore, DocumentRepository, PendingSet};
use crate::types::{ActionKind, ActionOutcome, Analysis, ContentAddress, DocumentFacts, DocumentRecord};

pub fn sample_analysis() -> Analysis {
    Analysis {
        title: "Electricity bill".to_string(),
        doc_type: "Invoice".to_string(),
        purpose: "Billing for services rendered".to_string(),
        tags: vec!["invoice".to_string(), "energy".to_string()],
        dates: vec!["2024-03-01".to_string()],
        entities: vec!["Power Co".to_string()],
        summary: "Monthly electricity invoice.".to_string(),
    }
}

/// A `generateContent` reply carrying `analysis` as its text part
pub fn analysis_reply(analysis: &Analysis) -> String {
    let text = serde_json::to_string(analysis).unwrap();
    serde_json::json!({
        "candidates": [{ "content": { "parts": [{ "text": text }] } }]
    })
    .to_string()
}

pub fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> {
    stream::iter(
        parts
            .iter()
            .map(|p| Ok(Bytes::from_static(p)))
            .collect::<Vec<_>>(),
    )
}

/// Commit bytes to the store and build (but do not persist) their record
pub async fn stage_document(store: &ContentStore, bytes: &[u8], name: &str, mime: &str) -> DocumentRecord {
    let staged = store
        .stage(stream::iter(vec![Ok::<_, std::io::Error>(Bytes::copy_from_slice(bytes))]))
        .await
        .unwrap();
    let facts = DocumentFacts {
        address: staged.address.clone(),
        mime: mime.to_string(),
        size: staged.size,
        name: name.to_string(),
        uploaded_at: 1_700_000_000,
    };
    store.commit(staged).await.unwrap();
    DocumentRecord::new(facts)
}

/// Upstream that answers from a script of statuses, then a default
pub struct ScriptedUpstream {
    script: Mutex<VecDeque<u16>>,
    default_status: AtomicU16,
    body: Mutex<Bytes>,
    latency: Duration,
    calls: Mutex<Vec<(Instant, Bytes)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedUpstream {
    pub fn new(default_status: u16) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_status: AtomicU16::new(default_status),
            body: Mutex::new(Bytes::new()),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_script(self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.script.lock().extend(statuses);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_body(self, body: impl Into<Bytes>) -> Self {
        *self.body.lock() = body.into();
        self
    }

    pub fn set_default_status(&self, status: u16) {
        self.default_status.store(status, Ordering::SeqCst);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().iter().map(|(at, _)| *at).collect()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|(_, body)| String::from_utf8_lossy(body).into_owned())
            .collect()
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn call(&self, body: Bytes) -> Result<UpstreamReply> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().push((Instant::now(), body));

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self.script.lock().pop_front();
        let status = scripted.unwrap_or_else(|| self.default_status.load(Ordering::SeqCst));
        let body = self.body.lock().clone();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(UpstreamReply { status, body })
    }
}

/// Search mirror kept in a map
#[derive(Default)]
pub struct MemoryMirror {
    documents: DashMap<ContentAddress, IndexDocument>,
    upsert_delay: Duration,
}

impl MemoryMirror {
    /// Sleep inside every upsert before the write lands
    pub fn with_upsert_delay(mut self, delay: Duration) -> Self {
        self.upsert_delay = delay;
        self
    }

    pub fn contains(&self, address: &ContentAddress) -> bool {
        self.documents.contains_key(address)
    }
}

#[async_trait]
impl SearchMirror for MemoryMirror {
    async fn upsert_many(&self, records: &[DocumentRecord]) -> Result<()> {
        if !self.upsert_delay.is_zero() {
            tokio::time::sleep(self.upsert_delay).await;
        }
        for record in records.iter().filter(|r| !r.deleted) {
            self.documents
                .insert(record.address().clone(), IndexDocument::from(record));
        }
        Ok(())
    }

    async fn remove(&self, address: &ContentAddress) -> Result<()> {
        self.documents.remove(address);
        Ok(())
    }

    /// Echo the query and return every document as a hit
    async fn query(&self, request: Request) -> Result<Response> {
        let body = to_bytes(request.into_body(), usize::MAX)
            .await
            .map_err(|e| crate::error::Error::validation(e.to_string()))?;
        let query: serde_json::Value = serde_json::from_slice(&body)?;
        let hits: Vec<IndexDocument> = self.documents.iter().map(|d| d.value().clone()).collect();
        Ok(Json(serde_json::json!({ "query": query, "hits": hits })).into_response())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Deterministic media transforms
#[derive(Default)]
pub struct StubMedia;

#[async_trait]
impl MediaTransform for StubMedia {
    async fn optimize_image(&self, _bytes: Vec<u8>, _mime: &str) -> Result<Option<Vec<u8>>> {
        Ok(Some(b"optimized".to_vec()))
    }

    async fn thumbnail(&self, _bytes: Vec<u8>, _mime: &str) -> Result<Option<Vec<u8>>> {
        Ok(Some(b"thumbnail".to_vec()))
    }

    async fn rasterize_pdf(&self, _bytes: Vec<u8>) -> Result<Vec<u8>> {
        Ok(b"page".to_vec())
    }

    async fn recompress_for_analysis(&self, bytes: Vec<u8>, _mime: &str) -> Result<Option<Vec<u8>>> {
        Ok(Some(bytes))
    }
}

/// Action that sleeps, then returns a fixed outcome
pub struct DelayedAction {
    outcome: ActionOutcome,
    delay: Duration,
}

impl DelayedAction {
    pub fn new(outcome: ActionOutcome, delay_ms: u64) -> Self {
        Self {
            outcome,
            delay: Duration::from_millis(delay_ms),
        }
    }
}

#[async_trait]
impl Action for DelayedAction {
    fn kind(&self) -> ActionKind {
        self.outcome.kind()
    }

    async fn run(&self, _record: &DocumentRecord) -> Result<ActionOutcome> {
        tokio::time::sleep(self.delay).await;
        Ok(self.outcome.clone())
    }
}

const JOB_HISTORY: usize = 1024;

/// A full stack over a temporary data directory
pub struct Fixture {
    pub dir: TempDir,
    pub config: DocshelfConfig,
    pub store: Arc<ContentStore>,
    pub repository: Arc<DocumentRepository>,
    pub pending: PendingSet,
    pub mirror: Arc<MemoryMirror>,
    pub upstream: Arc<ScriptedUpstream>,
    pub orchestrator: Arc<Orchestrator>,
    pub intake: Intake,
    pub state: AppState,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::build(
            ScriptedUpstream::new(200).with_body(analysis_reply(&sample_analysis())),
            MemoryMirror::default(),
        )
        .await
    }

    /// Analysis calls answered with the sample analysis after `latency`
    pub async fn with_analysis_latency(latency: Duration) -> Self {
        Self::build(
            ScriptedUpstream::new(200)
                .with_body(analysis_reply(&sample_analysis()))
                .with_latency(latency),
            MemoryMirror::default(),
        )
        .await
    }

    pub async fn build(upstream: ScriptedUpstream, mirror: MemoryMirror) -> Self {
        let dir = TempDir::new().unwrap();
        let landing_page = dir.path().join("index.html");
        std::fs::write(&landing_page, "<html><body><h1>docshelf</h1></body></html>").unwrap();

        let mut config = DocshelfConfig::default();
        config.storage.data_dir = dir.path().join("data");
        config.server.landing_page = landing_page;
        config.analysis.endpoint = "http://analysis.invalid/generate".to_string();
        config.analysis.api_key = "test".to_string();
        config.search.url = "http://search.invalid".to_string();
        config.search.api_key = "test".to_string();
        config.search.index = "docs".to_string();

        let store = Arc::new(ContentStore::new(&config.storage.data_dir).unwrap());
        let repository = Arc::new(DocumentRepository::new(store.clone()));
        let pending = PendingSet::in_memory().unwrap();
        let mirror = Arc::new(mirror);
        let upstream = Arc::new(upstream);
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        };
        let (queue, _worker) = RequestQueue::spawn(upstream.clone(), policy, 16);
        let registry = Arc::new(ActionRegistry::standard(
            store.clone(),
            Arc::new(StubMedia),
            Arc::new(AnalysisClient::new(queue)),
            240,
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            repository.clone(),
            pending.clone(),
            registry,
            mirror.clone(),
            JOB_HISTORY,
        ));
        let intake = Intake::new(repository.clone(), pending.clone(), mirror.clone(), orchestrator.clone());
        let state = AppState::from_parts(
            config.clone(),
            repository.clone(),
            pending.clone(),
            mirror.clone(),
            orchestrator.clone(),
        );

        Self {
            dir,
            config,
            store,
            repository,
            pending,
            mirror,
            upstream,
            orchestrator,
            intake,
            state,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Orchestrator over the same storage with a different action set
    pub fn orchestrator_with(&self, registry: Arc<ActionRegistry>) -> Arc<Orchestrator> {
        self.orchestrator_keeping(registry, JOB_HISTORY)
    }

    /// As `orchestrator_with`, keeping only `history` finished runs
    pub fn orchestrator_keeping(&self, registry: Arc<ActionRegistry>, history: usize) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            self.repository.clone(),
            self.pending.clone(),
            registry,
            self.mirror.clone(),
            history,
        ))
    }

    /// Store a document as an upload would, without scheduling its pipeline
    pub async fn store_document(&self, bytes: &[u8], name: &str, mime: &str) -> DocumentRecord {
        let record = stage_document(&self.store, bytes, name, mime).await;
        self.pending.add(record.address()).unwrap();
        let admission = self
            .repository
            .admit(record.address(), || async { Ok(record.clone()) })
            .await
            .unwrap();
        self.repository.release(record.address());
        admission.into_record()
    }

    /// Wait until no pipeline is running for `address`
    pub async fn wait_idle(&self, address: &ContentAddress) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.orchestrator.is_running(address) {
            assert!(Instant::now() < deadline, "pipeline for {} did not finish", address);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Build a multipart upload request from `(field, filename, content type, body)` parts
pub fn multipart_upload(parts: &[(&str, Option<&str>, Option<&str>, &str)]) -> axum::http::Request<Body> {
    const BOUNDARY: &str = "docshelf-test-boundary";
    let mut body = String::new();
    for (field, filename, content_type, content) in parts {
        body.push_str(&format!("--{}\r\n", BOUNDARY));
        match filename {
            Some(filename) => body.push_str(&format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                field, filename
            )),
            None => body.push_str(&format!("Content-Disposition: form-data; name=\"{}\"\r\n", field)),
        }
        if let Some(content_type) = content_type {
            body.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        body.push_str("\r\n");
        body.push_str(content);
        body.push_str("\r\n");
    }
    body.push_str(&format!("--{}--\r\n", BOUNDARY));

    axum::http::Request::post("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

pub async fn read_json(response: Response) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}
