//! Core types for docshelf

pub mod address;
pub mod record;

pub use address::{address_to_path, companion_path, Companion, ContentAddress};
pub use record::{
    is_supported_mime, ActionKind, ActionOutcome, ActionResults, Analysis, DocumentFacts,
    DocumentRecord,
};
