//! Document records: write-once facts plus one result slot per action

use serde::{Deserialize, Serialize};
use std::fmt;

use super::address::ContentAddress;

/// Content type served for blobs that went through the optimize action
pub const OPTIMIZED_MIME: &str = "image/jpeg";

/// Content type of raster previews (images, PDF first pages)
pub const RASTER_PREVIEW_MIME: &str = "image/png";

/// Content type of text previews
pub const TEXT_PREVIEW_MIME: &str = "image/svg+xml";

/// Facts captured at upload time. Never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFacts {
    /// SHA-256 of the uploaded bytes
    pub address: ContentAddress,
    /// Declared mime type of the upload part
    pub mime: String,
    /// Number of bytes received
    pub size: u64,
    /// Original filename
    pub name: String,
    /// Upload time (unix seconds)
    pub uploaded_at: i64,
}

/// Structured metadata extracted by the analysis provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub title: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Dates found in the document, `YYYY-MM-DD`
    #[serde(default)]
    pub dates: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    pub summary: String,
}

/// Registered post-processing actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Optimize,
    Preview,
    Analyze,
}

impl ActionKind {
    pub const ALL: [ActionKind; 3] = [ActionKind::Optimize, ActionKind::Preview, ActionKind::Analyze];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Optimize => "optimize",
            ActionKind::Preview => "preview",
            ActionKind::Analyze => "analyze",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partial result produced by one action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Whether the blob was re-encoded in place
    Optimized(bool),
    /// Whether a preview file was written
    Preview(bool),
    /// Extracted metadata
    Analysis(Analysis),
}

impl ActionOutcome {
    /// The action that owns this outcome's slot
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionOutcome::Optimized(_) => ActionKind::Optimize,
            ActionOutcome::Preview(_) => ActionKind::Preview,
            ActionOutcome::Analysis(_) => ActionKind::Analyze,
        }
    }
}

/// Result slots, one per action. A filled slot marks the action as applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimize: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
}

impl ActionResults {
    pub fn is_applied(&self, kind: ActionKind) -> bool {
        match kind {
            ActionKind::Optimize => self.optimize.is_some(),
            ActionKind::Preview => self.preview.is_some(),
            ActionKind::Analyze => self.analysis.is_some(),
        }
    }

    /// Fill the outcome's slot. Returns `false` and leaves the slot untouched
    /// when it was already filled.
    pub fn merge(&mut self, outcome: ActionOutcome) -> bool {
        if self.is_applied(outcome.kind()) {
            return false;
        }
        match outcome {
            ActionOutcome::Optimized(applied) => self.optimize = Some(applied),
            ActionOutcome::Preview(available) => self.preview = Some(available),
            ActionOutcome::Analysis(analysis) => self.analysis = Some(analysis),
        }
        true
    }

    /// Actions that have not produced a result yet
    pub fn outstanding(&self) -> Vec<ActionKind> {
        ActionKind::ALL
            .into_iter()
            .filter(|kind| !self.is_applied(*kind))
            .collect()
    }
}

/// A stored document as persisted in its sidecar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    #[serde(flatten)]
    pub facts: DocumentFacts,
    /// Logical deletion flag; bytes are never removed
    #[serde(default)]
    pub deleted: bool,
    #[serde(flatten)]
    pub results: ActionResults,
}

impl DocumentRecord {
    pub fn new(facts: DocumentFacts) -> Self {
        Self {
            facts,
            deleted: false,
            results: ActionResults::default(),
        }
    }

    pub fn address(&self) -> &ContentAddress {
        &self.facts.address
    }

    pub fn is_image(&self) -> bool {
        self.facts.mime.starts_with("image/")
    }

    /// Content type for `GET /doc`: the declared mime, or the canonical
    /// optimized format once the blob has been re-encoded
    pub fn served_mime(&self) -> &str {
        if self.results.optimize == Some(true) {
            OPTIMIZED_MIME
        } else {
            &self.facts.mime
        }
    }

    /// Content type of this document's preview file
    pub fn preview_mime(&self) -> &'static str {
        if self.facts.mime.starts_with("text/") {
            TEXT_PREVIEW_MIME
        } else {
            RASTER_PREVIEW_MIME
        }
    }
}

/// Upload mimes are limited to the image, text and application families
pub fn is_supported_mime(mime: &str) -> bool {
    ["image/", "text/", "application/"]
        .iter()
        .any(|family| mime.starts_with(family))
}
