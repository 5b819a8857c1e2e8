//! Request and response bodies of the HTTP API, and the mapping from
//! [`QuiverError`] to HTTP status codes.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::error::QuiverError;
use crate::index::HnswConfig;
use crate::vector::{DistanceMetric, Metadata, VectorRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCollectionRequest {
    pub name: String,
    pub dimension: usize,
    #[serde(default)]
    pub metric: DistanceMetric,
    /// Return the existing collection instead of failing when the name is
    /// taken with the same dimension and metric.
    #[serde(default)]
    pub get_or_create: bool,
    /// Index settings; the engine default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<HnswConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorBody {
    pub id: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

impl From<VectorBody> for VectorRecord {
    fn from(body: VectorBody) -> Self {
        let record = VectorRecord::new(body.id, body.embedding).with_metadata(body.metadata);
        match body.document {
            Some(document) => record.with_document(document),
            None => record,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub vectors: Vec<VectorBody>,
}

/// Body of an upsert: one record, or `{"vectors": [..]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpsertRequest {
    Batch(BatchRequest),
    Single(VectorBody),
}

impl UpsertRequest {
    pub fn into_records(self) -> Vec<VectorRecord> {
        match self {
            UpsertRequest::Batch(batch) => batch.vectors.into_iter().map(Into::into).collect(),
            UpsertRequest::Single(body) => vec![body.into()],
        }
    }
}

impl From<VectorRecord> for VectorBody {
    fn from(record: VectorRecord) -> Self {
        VectorBody {
            id: record.id,
            embedding: record.embedding,
            metadata: record.metadata,
            document: record.document,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealResponse {
    pub segment_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactResponse {
    /// False when a compaction of the collection was already running.
    pub started: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropResponse {
    pub dropped: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

/// An error on its way to becoming an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub QuiverError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            QuiverError::DimensionMismatch { .. }
            | QuiverError::InvalidArgument(_)
            | QuiverError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            QuiverError::CollectionNotFound(_)
            | QuiverError::RecordNotFound(_)
            | QuiverError::SegmentNotFound(_) => StatusCode::NOT_FOUND,
            QuiverError::AlreadyExists(_) => StatusCode::CONFLICT,
            QuiverError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            QuiverError::OperationCancelled(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<QuiverError> for ApiError {
    fn from(err: QuiverError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(QuiverError::invalid_argument(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.0.code().to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (QuiverError::dimension_mismatch(3, 2), StatusCode::BAD_REQUEST),
            (QuiverError::collection_not_found("x"), StatusCode::NOT_FOUND),
            (QuiverError::already_exists("x"), StatusCode::CONFLICT),
            (QuiverError::overloaded("x"), StatusCode::SERVICE_UNAVAILABLE),
            (QuiverError::cancelled("x"), StatusCode::REQUEST_TIMEOUT),
            (QuiverError::corruption("x"), StatusCode::INTERNAL_SERVER_ERROR),
            (QuiverError::storage("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status(), status);
        }
    }

    #[test]
    fn test_vector_body_into_record() {
        let body: VectorBody = serde_json::from_value(json!({
            "id": "a",
            "embedding": [1.0, 0.0],
            "metadata": {"lang": "en", "year": 2024, "draft": false},
            "document": "hello"
        }))
        .unwrap();
        let record = VectorRecord::from(body);
        assert_eq!(record.id, "a");
        assert_eq!(record.document.as_deref(), Some("hello"));
        assert_eq!(record.metadata.len(), 3);
        assert!(!record.deleted);
    }

    #[test]
    fn test_upsert_accepts_single_or_batch() {
        let single: UpsertRequest =
            serde_json::from_value(json!({"id": "a", "embedding": [1.0]})).unwrap();
        assert_eq!(single.into_records().len(), 1);

        let batch: UpsertRequest = serde_json::from_value(json!({
            "vectors": [{"id": "a", "embedding": [1.0]}, {"id": "b", "embedding": [2.0]}]
        }))
        .unwrap();
        let ids: Vec<String> = batch.into_records().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_create_request_defaults() {
        let request: CreateCollectionRequest =
            serde_json::from_value(json!({"name": "docs", "dimension": 3})).unwrap();
        assert_eq!(request.metric, DistanceMetric::Cosine);
        assert!(!request.get_or_create);
        assert!(request.index.is_none());
    }
}
