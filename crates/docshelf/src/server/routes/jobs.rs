//! Pipeline progress endpoint

use axum::{
    extract::{Path, State},
    Json,
};

use crate::error::{Error, Result};
use crate::processing::PipelineProgress;
use crate::server::state::AppState;
use crate::types::ContentAddress;

/// GET /jobs/:address - Per-action state of the latest pipeline run
pub async fn get_pipeline(
    State(state): State<AppState>,
    Path(address): Path<ContentAddress>,
) -> Result<Json<PipelineProgress>> {
    state
        .orchestrator()
        .progress(&address)
        .map(Json)
        .ok_or_else(|| Error::not_found(format!("no pipeline has run for {}", address)))
}
