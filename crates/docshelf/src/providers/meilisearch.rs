//! Meilisearch-backed search mirror
//!
//! Talks to the Meilisearch REST API directly with reqwest. Writes are
//! enqueued as Meilisearch tasks and not awaited; the search endpoint is
//! proxied with bodies streamed in both directions.

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::Response;
use reqwest::{Client, StatusCode};
use serde_json::json;

use super::search_mirror::{IndexDocument, SearchMirror};
use crate::config::SearchConfig;
use crate::error::{Error, Result};
use crate::types::{ContentAddress, DocumentRecord};

const PRIMARY_KEY: &str = "address";

/// Headers that describe one hop and must not be forwarded
const HOP_HEADERS: [header::HeaderName; 6] = [
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::AUTHORIZATION,
];

/// Search mirror backed by a Meilisearch index
pub struct MeilisearchMirror {
    client: Client,
    base_url: String,
    api_key: String,
    index: String,
}

impl MeilisearchMirror {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("docshelf/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            index: config.index.clone(),
        })
    }

    fn index_url(&self) -> String {
        format!("{}/indexes/{}", self.base_url, self.index)
    }

    fn search_url(&self) -> String {
        format!("{}/search", self.index_url())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(Error::UpstreamRejected { status, body })
    }

    /// Create the index if missing and apply its sort/filter settings
    pub async fn ensure_index(&self) -> Result<()> {
        let response = self
            .client
            .get(self.index_url())
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::info!("Creating Meilisearch index '{}'", self.index);
            let create = self
                .client
                .post(format!("{}/indexes", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&json!({ "uid": self.index, "primaryKey": PRIMARY_KEY }))
                .send()
                .await?;
            Self::check(create).await?;
        } else {
            Self::check(response).await?;
        }

        let settings = self
            .client
            .patch(format!("{}/settings", self.index_url()))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "sortableAttributes": ["uploaded_at", "size", "name"],
                "filterableAttributes": ["uploaded_at", "mime", "type", "tags"],
            }))
            .send()
            .await?;
        Self::check(settings).await?;

        tracing::info!("Meilisearch index '{}' confirmed", self.index);
        Ok(())
    }
}

#[async_trait]
impl SearchMirror for MeilisearchMirror {
    async fn upsert_many(&self, records: &[DocumentRecord]) -> Result<()> {
        let documents: Vec<IndexDocument> = records
            .iter()
            .filter(|record| !record.deleted)
            .map(IndexDocument::from)
            .collect();
        if documents.is_empty() {
            return Ok(());
        }

        tracing::debug!("Upserting {} documents into '{}'", documents.len(), self.index);
        let response = self
            .client
            .post(format!("{}/documents", self.index_url()))
            .query(&[("primaryKey", PRIMARY_KEY)])
            .bearer_auth(&self.api_key)
            .json(&documents)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn remove(&self, address: &ContentAddress) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/documents/{}", self.index_url(), address))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn query(&self, request: Request) -> Result<Response> {
        let (parts, body) = request.into_parts();

        let mut headers = forwardable(&parts.headers);
        let credential = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| Error::Config("search api_key is not a valid header value".to_string()))?;
        headers.insert(header::AUTHORIZATION, credential);

        // Dropping this future (client went away) drops the upstream request too.
        let upstream = self
            .client
            .request(parts.method, self.search_url())
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(response_headers) = response.headers_mut() {
            *response_headers = forwardable(upstream.headers());
        }
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| Error::internal(format!("failed to build search response: {}", e)))
    }

    fn name(&self) -> &str {
        "meilisearch"
    }
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !HOP_HEADERS.contains(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}
