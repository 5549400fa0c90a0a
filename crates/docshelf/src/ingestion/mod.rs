//! Upload intake: staging, dedup admission and logical deletion
//!
//! Uploads are admitted in two phases. `stage` hashes each part into a
//! temporary file and checks its declared type; nothing is visible yet.
//! `admit` then commits a staged part under its address. The address is put
//! in the pending set before the sidecar is written, so no document can be
//! fetched without its pipeline being owed.

use bytes::Bytes;
use futures_util::Stream;
use std::fmt::Display;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::processing::{publish_to_mirror, Orchestrator};
use crate::providers::SearchMirror;
use crate::storage::{Admission, DocumentRepository, PendingSet, StagedBlob};
use crate::types::{is_supported_mime, ContentAddress, DocumentFacts, DocumentRecord};

/// Content type assumed for parts that do not declare one
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// A validated, hashed upload part waiting to be admitted
#[derive(Debug)]
pub struct StagedUpload {
    pub name: String,
    pub mime: String,
    pub blob: StagedBlob,
}

/// Admits uploads and retires documents
pub struct Intake {
    repository: Arc<DocumentRepository>,
    pending: PendingSet,
    mirror: Arc<dyn SearchMirror>,
    orchestrator: Arc<Orchestrator>,
}

impl Intake {
    pub fn new(
        repository: Arc<DocumentRepository>,
        pending: PendingSet,
        mirror: Arc<dyn SearchMirror>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            repository,
            pending,
            mirror,
            orchestrator,
        }
    }

    /// Check a part's declared type and hash its bytes into a temporary file
    pub async fn stage<S, E>(&self, name: String, mime: String, bytes: S) -> Result<StagedUpload>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        if !is_supported_mime(&mime) {
            return Err(Error::UnsupportedMime { name, mime });
        }

        let blob = self.repository.store().stage(bytes).await?;
        tracing::debug!("Staged '{}' ({}, {} bytes) as {}", name, mime, blob.size, blob.address);
        Ok(StagedUpload { name, mime, blob })
    }

    /// Make a staged upload addressable. Returns the existing record if the
    /// same bytes were stored before; the staged copy is then discarded.
    pub async fn admit(&self, upload: StagedUpload, uploaded_at: i64) -> Result<Admission> {
        let address = upload.blob.address.clone();
        let facts = DocumentFacts {
            address: address.clone(),
            mime: upload.mime,
            size: upload.blob.size,
            name: upload.name,
            uploaded_at,
        };

        let store = self.repository.store().clone();
        let pending = self.pending.clone();
        let blob = upload.blob;
        let admission = self
            .repository
            .admit(&address, move || async move {
                store.commit(blob).await?;
                pending.add(&facts.address)?;
                Ok(DocumentRecord::new(facts))
            })
            .await?;

        match &admission {
            Admission::Existing(record) => {
                tracing::info!("Upload of '{}' matches existing {}", record.facts.name, address);
                self.repository.release(&address);
            }
            Admission::Created(record) => {
                tracing::info!(
                    "Stored '{}' as {} ({} bytes)",
                    record.facts.name,
                    address,
                    record.facts.size
                );
                // Ordered with any concurrent delete of the same address.
                let mirror = &self.mirror;
                self.repository
                    .update_and_publish(&address, |_| (), |record| async move {
                        publish_to_mirror(mirror.as_ref(), &record).await
                    })
                    .await?;
                self.orchestrator.schedule(address);
            }
        }
        Ok(admission)
    }

    /// Mark a document deleted and drop it from the mirror. Bytes stay on disk.
    pub async fn delete(&self, address: &ContentAddress) -> Result<DocumentRecord> {
        let mirror = &self.mirror;
        let updated = self
            .repository
            .update_and_publish(address, |record| record.deleted = true, |record| async move {
                if let Err(e) = mirror.remove(record.address()).await {
                    tracing::warn!("{} removal of {} failed: {}", mirror.name(), record.address(), e);
                }
            })
            .await;
        self.repository.release(address);
        let (record, _) = updated?;
        tracing::info!("Deleted {}", address);
        Ok(record)
    }
}
