//! Upload endpoint

use axum::{
    extract::{Multipart, State},
    Json,
};
use futures_util::future::try_join_all;

use crate::error::{Error, Result};
use crate::ingestion::DEFAULT_MIME;
use crate::server::state::AppState;
use crate::storage::Admission;
use crate::types::DocumentRecord;

/// Multipart field carrying files
const FILES_FIELD: &str = "files";

/// POST /upload - Store files and schedule their processing
///
/// Every `files` part is validated and hashed before any of them is
/// committed, so one bad part rejects the whole request.
pub async fn upload_files(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Vec<DocumentRecord>>> {
    let uploaded_at = chrono::Utc::now().timestamp();
    let mut staged = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::validation(format!("malformed multipart body: {}", e)))?
    {
        if field.name() != Some(FILES_FIELD) {
            continue;
        }

        let name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| Error::validation("files part without a filename"))?;
        let mime = field.content_type().unwrap_or(DEFAULT_MIME).to_string();

        staged.push(state.intake().stage(name, mime, field).await?);
    }

    tracing::info!("Admitting {} uploaded files", staged.len());
    let admissions = try_join_all(
        staged
            .into_iter()
            .map(|upload| state.intake().admit(upload, uploaded_at)),
    )
    .await?;

    Ok(Json(admissions.into_iter().map(Admission::into_record).collect()))
}
