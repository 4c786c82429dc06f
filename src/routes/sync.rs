//! Sync API endpoints
//!
//! Pull change-sets, push conditional writes, and inspect collections.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::sync::{
    CollectionStatus, NewRecord, ReadEnvelope, ReadRequest, StrategyInfo, SyncableRecord,
    WriteEnvelope, WriteRequest,
};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_strategy))
        .route("/:collection", get(pull_changes).post(create_record))
        .route("/:collection/_status", get(get_collection_status))
        .route("/:collection/:id", put(push_write))
}

/// Query parameters for a pull
#[derive(Debug, Deserialize)]
pub struct PullQuery {
    pub cursor: Option<String>,
    pub scope: Option<String>,
}

/// Describe the sync contract
async fn get_strategy(State(state): State<AppState>) -> Json<StrategyInfo> {
    Json(state.strategy())
}

/// Pull records changed since the cursor
async fn pull_changes(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(query): Query<PullQuery>,
    headers: HeaderMap,
) -> Result<ReadEnvelope> {
    state
        .engine()
        .read(ReadRequest {
            collection,
            cursor: query.cursor,
            scope: query.scope.filter(|s| !s.is_empty()),
            if_none_match: if_none_match(&headers),
        })
        .await
}

/// Write a record, guarded by `assumedModifiedAt`
async fn push_write(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    body: std::result::Result<Json<Map<String, Value>>, JsonRejection>,
) -> Result<WriteEnvelope> {
    let Json(body) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;

    state
        .engine()
        .write(WriteRequest {
            collection,
            id,
            body,
        })
        .await
}

/// Create a record
async fn create_record(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    body: std::result::Result<Json<NewRecord>, JsonRejection>,
) -> Result<(StatusCode, Json<SyncableRecord>)> {
    let Json(record) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let created = state.engine().create(&collection, record).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Collection diagnostics
async fn get_collection_status(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> Result<Json<CollectionStatus>> {
    let status = state.engine().collection_status(&collection).await?;
    Ok(Json(status))
}

/// All `If-None-Match` values, joined as one list
fn if_none_match(headers: &HeaderMap) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}
