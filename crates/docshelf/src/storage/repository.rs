//! Metadata cache over JSON sidecars
//!
//! Every document that is being worked on gets a slot in the active map. A
//! slot is an async mutex around the cached record; all writes for one
//! address lock it, re-read the record, apply the change, write the sidecar
//! and only then update the cache. Concurrent action completions therefore
//! serialize per document instead of overwriting each other.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

use super::content_store::ContentStore;
use crate::error::{Error, Result};
use crate::types::{address::DOC_DIR, Companion, ContentAddress, DocumentRecord};

type Slot = Arc<Mutex<Option<DocumentRecord>>>;

/// Outcome of admitting an upload
#[derive(Debug, Clone)]
pub enum Admission {
    /// A new record was persisted
    Created(DocumentRecord),
    /// A record with the same address already existed; nothing was written
    Existing(DocumentRecord),
}

impl Admission {
    pub fn record(&self) -> &DocumentRecord {
        match self {
            Admission::Created(record) | Admission::Existing(record) => record,
        }
    }

    pub fn into_record(self) -> DocumentRecord {
        match self {
            Admission::Created(record) | Admission::Existing(record) => record,
        }
    }
}

/// Cache of active document records, write-through to sidecars
pub struct DocumentRepository {
    store: Arc<ContentStore>,
    active: DashMap<ContentAddress, Slot>,
}

impl DocumentRepository {
    pub fn new(store: Arc<ContentStore>) -> Self {
        Self {
            store,
            active: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// Number of records currently held in memory
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    fn slot(&self, address: &ContentAddress) -> Slot {
        self.active
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn read_sidecar(&self, address: &ContentAddress) -> Result<Option<DocumentRecord>> {
        let path = self.store.companion_path(address, Companion::Sidecar);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_sidecar(&self, record: &DocumentRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        self.store
            .write_companion(record.address(), Companion::Sidecar, &json)
            .await
    }

    async fn fill(&self, address: &ContentAddress, cached: &mut Option<DocumentRecord>) -> Result<()> {
        if cached.is_none() {
            *cached = self.read_sidecar(address).await?;
        }
        Ok(())
    }

    /// Look up a record, active cache first, sidecar second.
    pub async fn find(&self, address: &ContentAddress) -> Result<Option<DocumentRecord>> {
        let existing = self.active.get(address).map(|slot| slot.value().clone());
        if let Some(slot) = existing {
            let mut cached = slot.lock().await;
            self.fill(address, &mut cached).await?;
            return Ok(cached.clone());
        }

        // Records that nobody is working on are read straight from disk and
        // stay out of the active map.
        self.read_sidecar(address).await
    }

    /// Like [`find`](Self::find) but a missing record is an error
    pub async fn get(&self, address: &ContentAddress) -> Result<DocumentRecord> {
        self.find(address)
            .await?
            .ok_or_else(|| Error::not_found(format!("document {}", address)))
    }

    /// Return the existing record for `address`, or run `prepare` and persist
    /// the record it yields. The slot stays locked throughout, so two uploads
    /// of the same bytes cannot both create a record.
    pub async fn admit<F, Fut>(&self, address: &ContentAddress, prepare: F) -> Result<Admission>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DocumentRecord>>,
    {
        let slot = self.slot(address);
        let mut cached = slot.lock().await;
        self.fill(address, &mut cached).await?;

        if let Some(existing) = cached.as_ref() {
            return Ok(Admission::Existing(existing.clone()));
        }

        let record = prepare().await?;
        if record.address() != address {
            return Err(Error::internal(format!(
                "prepared record {} does not match slot {}",
                record.address(),
                address
            )));
        }
        self.write_sidecar(&record).await?;
        *cached = Some(record.clone());
        Ok(Admission::Created(record))
    }

    /// Read-merge-write one record. The cache only changes once the sidecar
    /// write has succeeded.
    pub async fn update<F, T>(&self, address: &ContentAddress, change: F) -> Result<(DocumentRecord, T)>
    where
        F: FnOnce(&mut DocumentRecord) -> T,
    {
        self.update_and_publish(address, change, |_| std::future::ready(()))
            .await
    }

    /// Like [`update`](Self::update), then hand the stored record to
    /// `publish` before the slot is unlocked. Side effects published this way
    /// happen in the same order as the writes to the address.
    pub async fn update_and_publish<F, T, P, Fut>(
        &self,
        address: &ContentAddress,
        change: F,
        publish: P,
    ) -> Result<(DocumentRecord, T)>
    where
        F: FnOnce(&mut DocumentRecord) -> T,
        P: FnOnce(DocumentRecord) -> Fut,
        Fut: Future<Output = ()>,
    {
        let slot = self.slot(address);
        let mut cached = slot.lock().await;
        self.fill(address, &mut cached).await?;

        let mut record = cached
            .clone()
            .ok_or_else(|| Error::not_found(format!("document {}", address)))?;
        let output = change(&mut record);

        if cached.as_ref() != Some(&record) {
            self.write_sidecar(&record).await?;
            *cached = Some(record.clone());
        }
        publish(record.clone()).await;
        Ok((record, output))
    }

    /// Drop the cached record if nobody else is holding its slot.
    pub fn release(&self, address: &ContentAddress) -> bool {
        self.active
            .remove_if(address, |_, slot| Arc::strong_count(slot) == 1)
            .is_some()
    }

    /// Every record on disk, preferring cached copies. Used to rebuild the
    /// search index.
    pub async fn scan_all(&self) -> Result<Vec<DocumentRecord>> {
        let mut records = Vec::new();
        let mut shards = fs::read_dir(self.store.root().join(DOC_DIR)).await?;

        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let shard_name = shard.file_name().to_string_lossy().to_string();
            let mut entries = fs::read_dir(shard.path()).await?;

            while let Some(entry) = entries.next_entry().await? {
                let file_name = entry.file_name().to_string_lossy().to_string();
                let Some(rest) = file_name.strip_suffix(".json") else {
                    continue;
                };
                let address = match ContentAddress::parse(&format!("{}{}", shard_name, rest)) {
                    Ok(address) => address,
                    Err(_) => {
                        tracing::warn!("Skipping stray sidecar {}", entry.path().display());
                        continue;
                    }
                };
                match self.find(&address).await {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("Unreadable sidecar for {}: {}", address, e),
                }
                self.release(&address);
            }
        }

        Ok(records)
    }
}
