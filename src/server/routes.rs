//! Request handlers.
//!
//! Engine calls block on locks, disk and the rayon search pool, so every
//! handler runs its engine work on tokio's blocking pool.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::collection::{CollectionConfig, CollectionInfo};
use crate::engine::{Engine, EngineHealth};
use crate::error::{QuiverError, Result};
use crate::query::{QueryRequest, QueryResponse};
use crate::vector::VectorRecord;
use crate::wal::WriteReceipt;

use super::model::{
    ApiError, ApiResult, BatchRequest, CompactResponse, CountResponse, CreateCollectionRequest,
    DeleteResponse, DropResponse, SealResponse, UpsertRequest, VectorBody,
};

pub type SharedEngine = Arc<Engine>;

/// Run `work` on the blocking pool.
async fn blocking<T, F>(work: F) -> ApiResult<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(err) => Err(ApiError(QuiverError::internal(format!(
            "request worker failed: {err}"
        )))),
    }
}

/// GET /health
pub async fn health(State(engine): State<SharedEngine>) -> ApiResult<Json<EngineHealth>> {
    let health = blocking(move || Ok(engine.health())).await?;
    Ok(Json(health))
}

/// GET /collections
pub async fn list_collections(
    State(engine): State<SharedEngine>,
) -> ApiResult<Json<Vec<CollectionInfo>>> {
    let collections = blocking(move || Ok(engine.list_collections())).await?;
    Ok(Json(collections))
}

/// POST /collections
///
/// 201 with the new collection, or 200 when `get_or_create` found an existing
/// one with the same shape.
pub async fn create_collection(
    State(engine): State<SharedEngine>,
    payload: std::result::Result<Json<CreateCollectionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let (status, info) = blocking(move || {
        let existed = request.get_or_create && engine.manager().contains(&request.name);
        let collection = match (request.get_or_create, request.index) {
            (true, _) => {
                engine.get_or_create_collection(&request.name, request.dimension, request.metric)?
            }
            (false, Some(index)) => engine.manager().create_with(
                CollectionConfig::new(&request.name, request.dimension, request.metric)
                    .with_index(index),
            )?,
            (false, None) => {
                engine.create_collection(&request.name, request.dimension, request.metric)?
            }
        };
        let status = if existed {
            StatusCode::OK
        } else {
            StatusCode::CREATED
        };
        Ok((status, collection.info()))
    })
    .await?;
    Ok((status, Json(info)))
}

/// GET /collections/:name
pub async fn get_collection(
    State(engine): State<SharedEngine>,
    Path(name): Path<String>,
) -> ApiResult<Json<CollectionInfo>> {
    let info = blocking(move || Ok(engine.collection(&name)?.info())).await?;
    Ok(Json(info))
}

/// DELETE /collections/:name
pub async fn drop_collection(
    State(engine): State<SharedEngine>,
    Path(name): Path<String>,
) -> ApiResult<Json<DropResponse>> {
    let dropped = blocking(move || {
        engine.drop_collection(&name)?;
        Ok(name)
    })
    .await?;
    Ok(Json(DropResponse { dropped }))
}

/// POST /collections/:name/vectors
pub async fn add_vector(
    State(engine): State<SharedEngine>,
    Path(name): Path<String>,
    payload: std::result::Result<Json<VectorBody>, JsonRejection>,
) -> ApiResult<Json<WriteReceipt>> {
    let Json(body) = payload?;
    let receipt = blocking(move || engine.collection(&name)?.add(body.into())).await?;
    Ok(Json(receipt))
}

/// POST /collections/:name/vectors/batch
pub async fn add_batch(
    State(engine): State<SharedEngine>,
    Path(name): Path<String>,
    payload: std::result::Result<Json<BatchRequest>, JsonRejection>,
) -> ApiResult<Json<WriteReceipt>> {
    let Json(batch) = payload?;
    let records: Vec<VectorRecord> = batch.vectors.into_iter().map(Into::into).collect();
    let receipt = blocking(move || engine.collection(&name)?.add_batch(records)).await?;
    Ok(Json(receipt))
}

/// POST /collections/:name/vectors/upsert
pub async fn upsert_vectors(
    State(engine): State<SharedEngine>,
    Path(name): Path<String>,
    payload: std::result::Result<Json<UpsertRequest>, JsonRejection>,
) -> ApiResult<Json<WriteReceipt>> {
    let Json(request) = payload?;
    let records = request.into_records();
    let receipt = blocking(move || engine.collection(&name)?.upsert_batch(records)).await?;
    Ok(Json(receipt))
}

/// GET /collections/:name/vectors/:id
pub async fn get_vector(
    State(engine): State<SharedEngine>,
    Path((name, id)): Path<(String, String)>,
) -> ApiResult<Json<VectorBody>> {
    let record = blocking(move || {
        engine
            .collection(&name)?
            .get(&id)?
            .ok_or(QuiverError::RecordNotFound(id))
    })
    .await?;
    Ok(Json(record.into()))
}

/// DELETE /collections/:name/vectors/:id
pub async fn delete_vector(
    State(engine): State<SharedEngine>,
    Path((name, id)): Path<(String, String)>,
) -> ApiResult<Json<DeleteResponse>> {
    let deleted = blocking(move || engine.collection(&name)?.delete(&id)).await?;
    Ok(Json(DeleteResponse { deleted }))
}

/// GET /collections/:name/count
pub async fn count(
    State(engine): State<SharedEngine>,
    Path(name): Path<String>,
) -> ApiResult<Json<CountResponse>> {
    let count = blocking(move || engine.collection(&name)?.count()).await?;
    Ok(Json(CountResponse { count }))
}

/// POST /collections/:name/query
pub async fn query(
    State(engine): State<SharedEngine>,
    Path(name): Path<String>,
    payload: std::result::Result<Json<QueryRequest>, JsonRejection>,
) -> ApiResult<Json<QueryResponse>> {
    let Json(request) = payload?;
    let response = blocking(move || engine.collection(&name)?.query(&request)).await?;
    Ok(Json(response))
}

/// POST /collections/:name/seal
pub async fn seal(
    State(engine): State<SharedEngine>,
    Path(name): Path<String>,
) -> ApiResult<Json<SealResponse>> {
    let segment_id = blocking(move || engine.collection(&name)?.seal()).await?;
    Ok(Json(SealResponse { segment_id }))
}

/// POST /collections/:name/compact
///
/// Answers 202 as soon as the compaction thread is running.
pub async fn compact(
    State(engine): State<SharedEngine>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let started = blocking(move || engine.compact_in_background(&name)).await?;
    Ok((StatusCode::ACCEPTED, Json(CompactResponse { started })))
}

