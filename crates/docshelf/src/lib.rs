//! docshelf: content-addressed document store
//!
//! Uploads are stored once per SHA-256 digest. Every stored document owes a
//! small pipeline of post-processing actions (optimize, preview, analyze)
//! whose results are merged into a JSON sidecar and mirrored into a search
//! index. A SQLite pending set lets an interrupted pipeline resume after a
//! restart.

pub mod config;
pub mod error;
pub mod ingestion;
pub mod processing;
pub mod providers;
pub mod server;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::DocshelfConfig;
pub use error::{Error, Result};
pub use types::{ContentAddress, DocumentRecord};
