//! Content addresses and the sharded on-disk layout derived from them

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Length of a hex-encoded SHA-256 digest
pub const ADDRESS_LEN: usize = 64;

/// Directory (under the data dir) holding all shards
pub const DOC_DIR: &str = "doc";

/// SHA-256 digest of a document's exact bytes, lowercase hex.
///
/// The only ways to obtain one are [`ContentAddress::parse`] and hashing
/// (see [`ContentAddress::from_digest`]), so every value is well-formed and
/// safe to splice into filesystem paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentAddress(String);

impl ContentAddress {
    /// Validate a candidate address: exactly 64 lowercase hex characters
    pub fn parse(candidate: &str) -> Result<Self> {
        let well_formed = candidate.len() == ADDRESS_LEN
            && candidate
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

        if well_formed {
            Ok(Self(candidate.to_string()))
        } else {
            Err(Error::validation(format!("malformed content address '{}'", candidate)))
        }
    }

    /// Build an address from a finished SHA-256 digest
    pub fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shard directory name (first two hex characters)
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }

    /// Blob file name within the shard (remaining characters)
    pub fn blob_name(&self) -> &str {
        &self.0[2..]
    }
}

impl fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentAddress {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentAddress> for String {
    fn from(address: ContentAddress) -> Self {
        address.0
    }
}

/// Blob path for an address: `{root}/doc/{addr[0:2]}/{addr[2:]}`
pub fn address_to_path(root: &Path, address: &ContentAddress) -> PathBuf {
    root.join(DOC_DIR).join(address.shard()).join(address.blob_name())
}

/// Derived files stored next to a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Companion {
    /// JSON metadata sidecar
    Sidecar,
    /// Generated preview
    Preview,
    /// Original bytes kept when the blob is optimized in place
    Source,
}

impl Companion {
    fn suffix(self) -> &'static str {
        match self {
            Companion::Sidecar => ".json",
            Companion::Preview => "_preview",
            Companion::Source => "_source",
        }
    }
}

/// Path of a companion file: the blob path plus a fixed suffix
pub fn companion_path(root: &Path, address: &ContentAddress, companion: Companion) -> PathBuf {
    let mut path = address_to_path(root, address).into_os_string();
    path.push(companion.suffix());
    PathBuf::from(path)
}
