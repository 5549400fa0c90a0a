//! Error types for docshelf

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for docshelf operations
pub type Result<T> = std::result::Result<T, Error>;

/// Docshelf errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed request (bad upload part, bad address segment)
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Upload part with a mime outside image/*, text/*, application/*
    #[error("{name}: {mime} not supported")]
    UnsupportedMime { name: String, mime: String },

    /// Missing blob, sidecar or preview
    #[error("Not found: {0}")]
    NotFound(String),

    /// Throttling or server errors persisted past the retry cap
    #[error("Upstream still failing with status {status} after {attempts} attempts")]
    UpstreamExhausted { status: u16, attempts: u32 },

    /// Upstream answered with a non-retryable status
    #[error("Upstream rejected request with status {status}: {body}")]
    UpstreamRejected { status: u16, body: String },

    /// Upstream answered but the payload could not be used
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// Image decode/encode or PDF rasterisation failure
    #[error("Media transform failed: {0}")]
    Media(String),

    /// Pending set database error
    #[error("Database error: {0}")]
    Database(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a media transform error
    pub fn media(message: impl Into<String>) -> Self {
        Self::Media(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this error means the addressed document does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Media(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.is_not_found() {
            let body = Json(json!({
                "error": { "type": "not_found", "message": self.to_string() }
            }));
            return (StatusCode::NOT_FOUND, body).into_response();
        }

        let (status, error_type, message) = match &self {
            Error::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.clone()),
            Error::Validation(msg) => (StatusCode::BAD_REQUEST, "invalid_request", msg.clone()),
            Error::UnsupportedMime { .. } => {
                (StatusCode::BAD_REQUEST, "unsupported_type", self.to_string())
            }
            Error::UpstreamExhausted { .. } | Error::UpstreamRejected { .. } => {
                (StatusCode::BAD_GATEWAY, "upstream_error", self.to_string())
            }
            Error::Http(err) => (StatusCode::BAD_GATEWAY, "http_error", err.to_string()),
            Error::Extraction(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "extraction_error", msg.clone())
            }
            Error::Media(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "media_error", msg.clone()),
            Error::Database(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", msg.clone())
            }
            Error::Io(err) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error", err.to_string()),
            Error::Json(err) => (StatusCode::INTERNAL_SERVER_ERROR, "json_error", err.to_string()),
            Error::NotFound(msg) | Error::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone())
            }
        };

        if status.is_server_error() {
            tracing::error!("Request failed ({}): {}", error_type, message);
        }

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
