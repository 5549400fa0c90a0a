//! Configuration for docshelf

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::processing::RetryPolicy;

/// Main docshelf configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocshelfConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Data directory layout
    pub storage: StorageConfig,
    /// Analysis provider (Gemini)
    pub analysis: AnalysisConfig,
    /// Search mirror (Meilisearch)
    pub search: SearchConfig,
    /// Post-processing configuration
    pub processing: ProcessingConfig,
}

impl DocshelfConfig {
    /// Load from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                toml::from_str(&raw)
                    .map_err(|e| Error::Config(format!("invalid {}: {}", path.display(), e)))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Override settings from environment variables
    pub fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = var("DOCSHELF_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = var("DOCSHELF_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| Error::Config(format!("DOCSHELF_PORT is not a port: {}", port)))?;
        }
        if let Some(endpoint) = var("GEMINI_ENDPOINT") {
            self.analysis.endpoint = endpoint;
        }
        if let Some(key) = var("GEMINI_API_KEY") {
            self.analysis.api_key = key;
        }
        if let Some(url) = var("MEILI_URL") {
            self.search.url = url;
        }
        if let Some(key) = var("MEILI_API_KEY") {
            self.search.api_key = key;
        }
        if let Some(index) = var("MEILI_INDEX") {
            self.search.index = index;
        }
        Ok(())
    }

    /// Fail fast on missing required values
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("analysis.endpoint", &self.analysis.endpoint),
            ("analysis.api_key", &self.analysis.api_key),
            ("search.url", &self.search.url),
            ("search.api_key", &self.search.api_key),
            ("search.index", &self.search.index),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            return Err(Error::Config(format!("missing required settings: {}", missing.join(", "))));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
    /// Maximum upload size in bytes (default: 100MB)
    pub max_upload_size: usize,
    /// Page served for any unrouted GET
    pub landing_page: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
            max_upload_size: 100 * 1024 * 1024, // 100MB
            landing_page: PathBuf::from("index.html"),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for blobs, sidecars and the pending database
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn pending_db_path(&self) -> PathBuf {
        self.data_dir.join("pending.db")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docshelf");
        Self { data_dir }
    }
}

/// Analysis provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Full `generateContent` URL
    pub endpoint: String,
    /// Sent as `x-goog-api-key`
    pub api_key: String,
    /// Retries for 429/5xx replies
    pub max_retries: u32,
    /// Backoff unit: retry n waits n² × this
    pub base_delay_ms: u64,
    /// Requests that may wait in the queue before callers block
    pub queue_capacity: usize,
}

impl AnalysisConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            max_retries: 10,
            base_delay_ms: 1000,
            queue_capacity: 256,
        }
    }
}

/// Search mirror configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Meilisearch base URL
    pub url: String,
    /// Meilisearch API key
    pub api_key: String,
    /// Index name
    pub index: String,
}

/// Post-processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Image and PDF transforms that may run at once (default: CPU count, max 8)
    pub max_concurrent_transforms: usize,
    /// Page size when walking the pending set at startup
    pub pending_scan_batch: usize,
    /// Finished pipeline runs kept for `GET /jobs`
    pub job_history: usize,
    /// Optimized images are scaled down to this height
    pub optimize_max_height: u32,
    /// Images sent for analysis are scaled down to this height
    pub analysis_max_height: u32,
    /// Previews fit in a square of this size
    pub thumbnail_size: u32,
    pub jpeg_quality: u8,
    /// pdftoppm binary used for PDF previews
    pub pdftoppm_path: String,
    /// Records per request when rebuilding the search mirror
    pub reindex_batch: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transforms: num_cpus::get().min(8),
            pending_scan_batch: 500,
            job_history: 1024,
            optimize_max_height: 1920,
            analysis_max_height: 960,
            thumbnail_size: 240,
            jpeg_quality: 82,
            pdftoppm_path: "pdftoppm".to_string(),
            reindex_batch: 1000,
        }
    }
}
