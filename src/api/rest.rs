//! REST API for the sequencer steps and revision inspection

use axum::body::Bytes;
use axum::extract::rejection::{PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::ApiError;
use crate::domain::{DirectoryId, MapMetadata, SignedMapRoot};
use crate::sequencer::{read_revision_mutations, MutationPage, StepOutcome};
use crate::server::AppState;

/// Largest page a caller may request
const MAX_PAGE_SIZE: u64 = 1000;

/// Build the `/api` router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/directories/:directory_id/run-batch", post(run_batch))
        .route(
            "/v1/directories/:directory_id/revisions/:revision/create",
            post(create_revision),
        )
        .route("/v1/directories/:directory_id/publish", post(publish_batch))
        .route("/v1/directories/:directory_id/root", get(get_latest_root))
        .route(
            "/v1/directories/:directory_id/revisions/:revision/batch",
            get(get_batch),
        )
        .route(
            "/v1/directories/:directory_id/revisions/:revision/mutations",
            get(list_mutations),
        )
}

type DirectoryPath = Result<Path<String>, PathRejection>;
type RevisionPath = Result<Path<(String, u64)>, PathRejection>;

fn parse_directory(directory_id: &str) -> Result<DirectoryId, ApiError> {
    DirectoryId::parse(directory_id).map_err(ApiError::invalid_argument)
}

fn directory(path: DirectoryPath) -> Result<DirectoryId, ApiError> {
    let Path(directory_id) = path?;
    parse_directory(&directory_id)
}

fn directory_revision(path: RevisionPath) -> Result<(DirectoryId, u64), ApiError> {
    let Path((directory_id, revision)) = path?;
    Ok((parse_directory(&directory_id)?, revision))
}

/// Admission bounds for one run. Omitted fields use the configured bounds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunBatchRequest {
    pub min_batch: Option<u64>,
    pub max_batch: Option<u64>,
}

impl RunBatchRequest {
    /// An empty body selects the configured bounds; anything else must parse
    fn from_body(body: &[u8]) -> Result<Self, ApiError> {
        if body.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| ApiError::invalid_body(format!("invalid run-batch body: {e}")))
    }
}

#[derive(Debug, Serialize)]
pub struct StepsResponse {
    pub directory_id: DirectoryId,
    pub steps: Vec<StepOutcome>,
}

async fn run_batch(
    State(state): State<AppState>,
    path: DirectoryPath,
    body: Bytes,
) -> Result<Json<StepsResponse>, ApiError> {
    let directory_id = directory(path)?;
    let request = RunBatchRequest::from_body(&body)?;
    let config = state.sequencer.config();
    let min_batch = request.min_batch.unwrap_or(config.min_batch);
    let max_batch = request.max_batch.unwrap_or(config.max_batch);

    let steps = state
        .sequencer
        .run_batch(&directory_id, min_batch, max_batch)
        .await?;
    Ok(Json(StepsResponse {
        directory_id,
        steps,
    }))
}

async fn create_revision(
    State(state): State<AppState>,
    path: RevisionPath,
) -> Result<Json<StepsResponse>, ApiError> {
    let (directory_id, revision) = directory_revision(path)?;
    let steps = state
        .sequencer
        .create_revision(&directory_id, revision)
        .await?;
    Ok(Json(StepsResponse {
        directory_id,
        steps,
    }))
}

async fn publish_batch(
    State(state): State<AppState>,
    path: DirectoryPath,
) -> Result<Json<StepsResponse>, ApiError> {
    let directory_id = directory(path)?;
    let step = state.sequencer.publish_batch(&directory_id).await?;
    Ok(Json(StepsResponse {
        directory_id,
        steps: vec![step],
    }))
}

async fn get_latest_root(
    State(state): State<AppState>,
    path: DirectoryPath,
) -> Result<Json<SignedMapRoot>, ApiError> {
    let directory_id = directory(path)?;
    let root = state
        .sequencer
        .map()
        .get_and_verify_latest_map_root(&directory_id)
        .await?;
    Ok(Json(root))
}

async fn get_batch(
    State(state): State<AppState>,
    path: RevisionPath,
) -> Result<Json<MapMetadata>, ApiError> {
    let (directory_id, revision) = directory_revision(path)?;
    let definition = state
        .sequencer
        .batches()
        .read_batch(&directory_id, revision)
        .await?;
    Ok(Json(definition))
}

#[derive(Debug, Deserialize)]
pub struct MutationsQuery {
    #[serde(default)]
    pub page_token: String,
    pub page_size: Option<u64>,
}

async fn list_mutations(
    State(state): State<AppState>,
    path: RevisionPath,
    query: Result<Query<MutationsQuery>, QueryRejection>,
) -> Result<Json<MutationPage>, ApiError> {
    let (directory_id, revision) = directory_revision(path)?;
    let Query(query) = query?;
    let page_size = query
        .page_size
        .unwrap_or(state.sequencer.config().page_size)
        .min(MAX_PAGE_SIZE);

    let page = read_revision_mutations(
        state.sequencer.reader().as_ref(),
        state.sequencer.batches().as_ref(),
        &directory_id,
        revision,
        &query.page_token,
        page_size,
    )
    .await?;
    Ok(Json(page))
}
