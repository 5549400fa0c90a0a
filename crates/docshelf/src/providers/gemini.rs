//! Gemini document analysis
//!
//! [`GeminiUpstream`] performs one raw `generateContent` call. [`AnalysisClient`]
//! builds the request, sends it through the serialized [`RequestQueue`] and
//! turns the reply into an [`Analysis`].

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::AnalysisConfig;
use crate::error::{Error, Result};
use crate::processing::{RequestQueue, Upstream, UpstreamReply};
use crate::types::Analysis;

const ANALYSIS_PROMPT: &str = r#"Analyze the attached file and extract metadata for a document search index.
The file may be a phone photo of paper (invoice, receipt, contract, note), a screenshot, a PDF, an ID card or anything else.
Respond with a single JSON object and nothing else, using exactly these keys:
{
  "title": "short title, at most 60 characters",
  "type": "kind of document, e.g. Invoice, Receipt, Contract, Letter, Photograph, Screenshot, Handwritten Note, Other",
  "purpose": "what the document is for",
  "summary": "one or two sentences describing the content",
  "tags": ["5 to 10 keywords useful for search"],
  "dates": ["every date found, formatted YYYY-MM-DD"],
  "entities": ["people, companies, products or places mentioned"]
}
Use empty arrays when nothing applies."#;

/// Raw HTTP access to the Gemini `generateContent` endpoint
pub struct GeminiUpstream {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl GeminiUpstream {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("docshelf/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl Upstream for GeminiUpstream {
    async fn call(&self, body: Bytes) -> Result<UpstreamReply> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(UpstreamReply { status, body })
    }
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(rename = "safetySettings")]
    safety_settings: Vec<SafetySetting>,
}

#[derive(Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

/// Harm categories sent with `BLOCK_NONE`
const UNFILTERED_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    Inline { inline_data: InlineData },
}

#[derive(Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "topK")]
    top_k: u32,
    #[serde(rename = "topP")]
    top_p: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ProviderError>,
}

#[derive(Deserialize)]
struct Candidate {
    content: ResponseContent,
}

#[derive(Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct ProviderError {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

/// Builds analysis requests and parses their replies
pub struct AnalysisClient {
    queue: RequestQueue,
}

impl AnalysisClient {
    pub fn new(queue: RequestQueue) -> Self {
        Self { queue }
    }

    /// Extract structured metadata from a document's bytes
    pub async fn analyze(&self, name: &str, mime: &str, bytes: &[u8]) -> Result<Analysis> {
        let request = build_request(name, mime, bytes);
        let body = Bytes::from(serde_json::to_vec(&request)?);
        tracing::debug!("Queueing analysis of '{}' ({}, {} bytes)", name, mime, bytes.len());

        let reply = self.queue.enqueue(body).await?;
        parse_reply(&reply)
    }
}

fn build_request(name: &str, mime: &str, bytes: &[u8]) -> GenerateRequest {
    let filename_hint = format!(
        "The original filename is \"{}\" with mime type \"{}\". The filename may hint at the content and type.",
        name, mime
    );

    GenerateRequest {
        contents: vec![Content {
            parts: vec![
                Part::Text {
                    text: ANALYSIS_PROMPT.to_string(),
                },
                Part::Text { text: filename_hint },
                Part::Inline {
                    inline_data: InlineData {
                        mime_type: mime.to_string(),
                        data: base64::engine::general_purpose::STANDARD.encode(bytes),
                    },
                },
            ],
        }],
        generation_config: GenerationConfig {
            temperature: 0.1,
            top_k: 32,
            top_p: 1.0,
            max_output_tokens: 65536,
            response_mime_type: "application/json".to_string(),
        },
        safety_settings: UNFILTERED_CATEGORIES
            .into_iter()
            .map(|category| SafetySetting {
                category,
                threshold: "BLOCK_NONE",
            })
            .collect(),
    }
}

/// Turn a provider reply into an [`Analysis`]
fn parse_reply(reply: &UpstreamReply) -> Result<Analysis> {
    let payload: Option<GenerateResponse> = serde_json::from_slice(&reply.body).ok();

    if !reply.is_success() {
        let message = payload
            .and_then(|p| p.error)
            .map(|e| e.message)
            .unwrap_or_else(|| String::from_utf8_lossy(&reply.body).into_owned());
        return Err(Error::UpstreamRejected {
            status: reply.status,
            body: message,
        });
    }

    let payload = payload.ok_or_else(|| Error::Extraction("reply is not a generateContent response".to_string()))?;
    if let Some(error) = payload.error {
        return Err(Error::Extraction(format!(
            "provider error {}: {}",
            error.code.unwrap_or_default(),
            error.message
        )));
    }

    let text = payload
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content.parts.into_iter().next())
        .and_then(|p| p.text)
        .ok_or_else(|| Error::Extraction("no text in provider reply".to_string()))?;

    serde_json::from_str(strip_code_fence(&text))
        .map_err(|e| Error::Extraction(format!("malformed analysis JSON: {}", e)))
}

/// Some models wrap JSON in a markdown fence despite being asked not to
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
