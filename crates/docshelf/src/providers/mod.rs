//! External services: the analysis provider and the search mirror
//!
//! Both sit behind traits (`Upstream`, `SearchMirror`) so the rest of the
//! crate can run against in-process stand-ins.

pub mod gemini;
pub mod meilisearch;
pub mod search_mirror;

pub use gemini::{AnalysisClient, GeminiUpstream};
pub use meilisearch::MeilisearchMirror;
pub use search_mirror::{rebuild, IndexDocument, SearchMirror};
