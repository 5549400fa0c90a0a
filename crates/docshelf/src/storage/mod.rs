//! Storage module: blobs, sidecars and the pending set
//!
//! Blobs and sidecars live on the local filesystem in a sharded layout; the
//! pending set is a small SQLite database next to them.

mod content_store;
mod pending;
mod repository;

pub use content_store::{ContentStore, StagedBlob};
pub use pending::PendingSet;
pub use repository::{Admission, DocumentRepository};
