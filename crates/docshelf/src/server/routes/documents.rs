//! Document fetch, preview, metadata and delete endpoints

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header, HeaderValue, StatusCode},
    response::Response,
    Json,
};
use chrono::{Duration, Utc};
use std::path::PathBuf;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use super::infallible;
use crate::error::{Error, Result};
use crate::server::state::AppState;
use crate::types::{Companion, ContentAddress, DocumentRecord};

/// Blobs and previews never change under an address
const IMMUTABLE: &str = "public, max-age=31536000, immutable";

/// GET /doc/:address - Stream the stored bytes
pub async fn get_document(
    State(state): State<AppState>,
    Path(address): Path<ContentAddress>,
    request: Request,
) -> Result<Response> {
    let record = state.repository().get(&address).await?;
    let path = state.repository().store().blob_path(&address);
    serve_immutable(path, record.served_mime(), request).await
}

/// GET /preview/:address - Stream the preview image
pub async fn get_preview(
    State(state): State<AppState>,
    Path(address): Path<ContentAddress>,
    request: Request,
) -> Result<Response> {
    let record = state.repository().get(&address).await?;
    if record.results.preview != Some(true) {
        return Err(Error::not_found(format!("preview for {}", address)));
    }
    let path = state
        .repository()
        .store()
        .companion_path(&address, Companion::Preview);
    serve_immutable(path, record.preview_mime(), request).await
}

/// GET /meta/:address - Get the document record
pub async fn get_meta(
    State(state): State<AppState>,
    Path(address): Path<ContentAddress>,
) -> Result<Json<DocumentRecord>> {
    Ok(Json(state.repository().get(&address).await?))
}

/// DELETE /doc/:address - Mark a document deleted
pub async fn delete_document(
    State(state): State<AppState>,
    Path(address): Path<ContentAddress>,
) -> Result<StatusCode> {
    state.intake().delete(&address).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn serve_immutable(path: PathBuf, mime: &str, request: Request) -> Result<Response> {
    let mut response = infallible(ServeFile::new(&path).oneshot(request).await).map(Body::new);

    match response.status() {
        StatusCode::NOT_FOUND => {
            return Err(Error::not_found(format!("{}", path.display())));
        }
        status if status.is_success() || status == StatusCode::NOT_MODIFIED => {}
        _ => return Ok(response),
    }

    let content_type = HeaderValue::from_str(mime)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let expires = (Utc::now() + Duration::days(365))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(IMMUTABLE));
    if let Ok(expires) = HeaderValue::from_str(&expires) {
        headers.insert(header::EXPIRES, expires);
    }
    Ok(response)
}
