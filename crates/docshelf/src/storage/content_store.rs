//! Content-addressed blob storage
//!
//! Uploads are written to a temporary file inside the data directory while a
//! SHA-256 digest is computed over the same chunks, so bytes are never fully
//! buffered in memory. The finished digest names the blob; committing is a
//! single rename into the sharded layout:
//!
//! ```text
//! {root}/doc/{addr[0:2]}/{addr[2:]}           blob
//! {root}/doc/{addr[0:2]}/{addr[2:]}.json      sidecar
//! {root}/doc/{addr[0:2]}/{addr[2:]}_preview   preview
//! {root}/doc/{addr[0:2]}/{addr[2:]}_source    original kept by optimize
//! ```

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::types::{address_to_path, companion_path, Companion, ContentAddress};

/// Directory (under the data dir) for in-flight uploads and atomic writes
const TMP_DIR: &str = "tmp";

/// Bytes that have been hashed and written to a temporary file but are not
/// yet reachable by address. Dropping it discards the bytes.
#[derive(Debug)]
pub struct StagedBlob {
    pub address: ContentAddress,
    pub size: u64,
    temp: TempPath,
}

impl StagedBlob {
    /// Location of the staged bytes
    pub fn path(&self) -> &Path {
        &self.temp
    }
}

/// Filesystem blob store rooted at the data directory
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(crate::types::address::DOC_DIR))?;
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, address: &ContentAddress) -> PathBuf {
        address_to_path(&self.root, address)
    }

    pub fn companion_path(&self, address: &ContentAddress, companion: Companion) -> PathBuf {
        companion_path(&self.root, address, companion)
    }

    /// Hash a byte stream while writing it to a temporary file.
    pub async fn stage<S, E>(&self, stream: S) -> Result<StagedBlob>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        let mut stream = std::pin::pin!(stream);
        let (file, temp) = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(self.root.join(TMP_DIR))?
            .into_parts();
        let mut file = fs::File::from_std(file);
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::validation(format!("upload stream failed: {}", e)))?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_data().await?;

        let address = ContentAddress::from_digest(&hasher.finalize());
        tracing::debug!("Staged {} ({} bytes) at {}", address, size, temp.display());

        Ok(StagedBlob { address, size, temp })
    }

    /// Move staged bytes to their blob path, making them addressable.
    pub async fn commit(&self, staged: StagedBlob) -> Result<PathBuf> {
        let dest = self.blob_path(&staged.address);
        if let Some(shard) = dest.parent() {
            fs::create_dir_all(shard).await?;
        }
        fs::rename(&staged.temp, &dest).await?;
        // The temp path no longer exists; disarm its cleanup.
        staged
            .temp
            .keep()
            .map_err(|e| Error::internal(format!("failed to release staged blob: {}", e)))?;
        Ok(dest)
    }

    pub async fn blob_exists(&self, address: &ContentAddress) -> bool {
        fs::try_exists(self.blob_path(address)).await.unwrap_or(false)
    }

    /// Bytes as uploaded: the `_source` copy if the blob was optimized, else the blob
    pub async fn read_original(&self, address: &ContentAddress) -> Result<Vec<u8>> {
        let source = self.companion_path(address, Companion::Source);
        match fs::read(&source).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(fs::read(self.blob_path(address)).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Copy the blob to `_source` unless a copy already exists
    pub async fn preserve_original(&self, address: &ContentAddress) -> Result<()> {
        let source = self.companion_path(address, Companion::Source);
        if fs::try_exists(&source).await? {
            return Ok(());
        }
        let bytes = fs::read(self.blob_path(address)).await?;
        self.write_atomic(&source, &bytes).await
    }

    /// Overwrite the blob in place (optimize)
    pub async fn replace_blob(&self, address: &ContentAddress, bytes: &[u8]) -> Result<()> {
        self.write_atomic(&self.blob_path(address), bytes).await
    }

    pub async fn write_companion(
        &self,
        address: &ContentAddress,
        companion: Companion,
        bytes: &[u8],
    ) -> Result<()> {
        self.write_atomic(&self.companion_path(address, companion), bytes).await
    }

    /// Write to a temporary file in the destination's directory, then rename over it.
    pub async fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<()> {
        let dir = dest
            .parent()
            .ok_or_else(|| Error::internal(format!("no parent directory for {}", dest.display())))?;
        fs::create_dir_all(dir).await?;

        let (file, temp) = tempfile::Builder::new()
            .prefix(".write-")
            .tempfile_in(dir)?
            .into_parts();
        let mut file = fs::File::from_std(file);
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_data().await?;
        drop(file);

        fs::rename(&temp, dest).await?;
        temp.keep()
            .map_err(|e| Error::internal(format!("failed to release temp file: {}", e)))?;
        Ok(())
    }
}
