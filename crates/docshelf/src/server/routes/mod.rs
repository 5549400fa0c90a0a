//! HTTP routes for the docshelf server

pub mod documents;
pub mod jobs;
pub mod search;
pub mod upload;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Request, State},
    http::Method,
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Router,
};
use std::convert::Infallible;
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::error::Error;
use crate::server::state::AppState;

/// Build all document routes
pub fn document_routes(max_upload_size: usize) -> Router<AppState> {
    Router::new()
        .route(
            "/upload",
            post(upload::upload_files)
                .fallback(not_found)
                .layer(DefaultBodyLimit::max(max_upload_size)),
        )
        .route("/search", post(search::proxy_search).fallback(not_found))
        .route(
            "/doc/:address",
            get(documents::get_document)
                .delete(documents::delete_document)
                .fallback(not_found),
        )
        .route("/preview/:address", get(documents::get_preview).fallback(not_found))
        .route("/meta/:address", get(documents::get_meta).fallback(not_found))
        .route("/jobs/:address", get(jobs::get_pipeline).fallback(not_found))
        .route("/doc", any(missing_address))
        .route("/doc/", any(missing_address))
        .route("/preview", any(missing_address))
        .route("/preview/", any(missing_address))
        .route("/meta", any(missing_address))
        .route("/meta/", any(missing_address))
        .route("/jobs", any(missing_address))
        .route("/jobs/", any(missing_address))
}

async fn missing_address() -> Error {
    Error::validation("missing document address")
}

async fn not_found() -> Error {
    Error::not_found("no such route")
}

/// Prefixes whose only route is `{prefix}{address}`
const ADDRESSED_PREFIXES: [&str; 4] = ["/doc/", "/preview/", "/meta/", "/jobs/"];

/// Any unrouted GET gets the landing page; anything else is a 404.
/// Extra segments after a document address are a bad request.
pub async fn landing(State(state): State<AppState>, request: Request) -> Response {
    let path = request.uri().path();
    if ADDRESSED_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return Error::validation("unexpected path after document address").into_response();
    }

    if request.method() != Method::GET && request.method() != Method::HEAD {
        return not_found().await.into_response();
    }

    let page = ServeFile::new(&state.config().server.landing_page);
    infallible(page.oneshot(request).await).map(Body::new)
}

/// Unreachable helper for `Infallible` results of tower-http services
pub(crate) fn infallible<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}
