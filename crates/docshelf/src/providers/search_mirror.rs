//! Search mirror abstraction
//!
//! The mirror holds a flattened copy of every live record. It is never the
//! source of truth: sidecars are, and [`rebuild`] can repopulate the mirror
//! from them at any time.

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::DocumentRepository;
use crate::types::{ContentAddress, DocumentRecord};

/// Flattened projection of a record as stored in the search index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub address: ContentAddress,
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub uploaded_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimize: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dates: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
}

impl From<&DocumentRecord> for IndexDocument {
    fn from(record: &DocumentRecord) -> Self {
        let facts = &record.facts;
        let analysis = record.results.analysis.as_ref();
        Self {
            address: facts.address.clone(),
            name: facts.name.clone(),
            mime: facts.mime.clone(),
            size: facts.size,
            uploaded_at: facts.uploaded_at,
            optimize: record.results.optimize,
            preview: record.results.preview,
            title: analysis.map(|a| a.title.clone()),
            doc_type: analysis.map(|a| a.doc_type.clone()),
            purpose: analysis.map(|a| a.purpose.clone()),
            summary: analysis.map(|a| a.summary.clone()),
            tags: analysis.map(|a| a.tags.clone()).unwrap_or_default(),
            dates: analysis.map(|a| a.dates.clone()).unwrap_or_default(),
            entities: analysis.map(|a| a.entities.clone()).unwrap_or_default(),
        }
    }
}

/// Secondary index kept in step with the sidecars
#[async_trait]
pub trait SearchMirror: Send + Sync {
    /// Insert or replace the projection of a record
    async fn upsert(&self, record: &DocumentRecord) -> Result<()> {
        self.upsert_many(std::slice::from_ref(record)).await
    }

    /// Insert or replace many projections at once
    async fn upsert_many(&self, records: &[DocumentRecord]) -> Result<()>;

    async fn remove(&self, address: &ContentAddress) -> Result<()>;

    /// Forward a raw search request and stream the raw answer back
    async fn query(&self, request: Request) -> Result<Response>;

    /// Get provider name
    fn name(&self) -> &str;
}

/// Push every live record on disk to the mirror. Returns how many were sent.
pub async fn rebuild(
    repository: &DocumentRepository,
    mirror: &dyn SearchMirror,
    batch_size: usize,
) -> Result<usize> {
    let live: Vec<DocumentRecord> = repository
        .scan_all()
        .await?
        .into_iter()
        .filter(|record| !record.deleted)
        .collect();

    for batch in live.chunks(batch_size.max(1)) {
        mirror.upsert_many(batch).await?;
        tracing::info!("Reindexed {} documents into {}", batch.len(), mirror.name());
    }
    Ok(live.len())
}
