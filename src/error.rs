use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::db::entities::video::VideoStatus;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("operation not valid while video is {current}")]
    StateConflict { current: VideoStatus },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("checksum mismatch on part {part_number}")]
    ChecksumMismatch {
        part_number: u32,
        expected_prefix: String,
        actual_prefix: String,
    },

    #[error("upload session expired")]
    UploadExpired,

    #[error("declared size {declared} exceeds the {max} byte limit")]
    TooLarge { declared: u64, max: u64 },

    #[error("{requested} parts exceeds the {max} part limit")]
    PartsLimit { requested: u64, max: u32 },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::StateConflict { .. } => "state_conflict",
            ApiError::NotFound(_) => "not_found",
            ApiError::ChecksumMismatch { .. } => "checksum_mismatch",
            ApiError::UploadExpired => "upload_expired",
            ApiError::TooLarge { .. } => "file_too_large",
            ApiError::PartsLimit { .. } => "parts_limit",
            ApiError::Store(_) => "storage_error",
            ApiError::Queue(_) => "queue_error",
            ApiError::Db(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": self.code(), "message": msg }),
            ),
            ApiError::StateConflict { current } => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": self.code(),
                    "message": self.to_string(),
                    "currentStatus": current.as_str(),
                }),
            ),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                json!({ "error": self.code(), "message": format!("not found: {}", what) }),
            ),
            ApiError::ChecksumMismatch {
                part_number,
                expected_prefix,
                actual_prefix,
            } => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": self.code(),
                    "message": self.to_string(),
                    "partNumber": part_number,
                    "expected": expected_prefix,
                    "received": actual_prefix,
                }),
            ),
            ApiError::UploadExpired => (
                StatusCode::BAD_REQUEST,
                json!({ "error": self.code(), "message": self.to_string() }),
            ),
            ApiError::TooLarge { declared, max } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                json!({
                    "error": self.code(),
                    "message": self.to_string(),
                    "declared": declared,
                    "max": max,
                }),
            ),
            ApiError::PartsLimit { requested, max } => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": self.code(),
                    "message": self.to_string(),
                    "requested": requested,
                    "max": max,
                }),
            ),
            ApiError::Store(StoreError::NotFound(key)) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "not_found", "message": format!("not found: {}", key) }),
            ),
            ApiError::Store(StoreError::Throttled(_)) => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": self.code(), "message": self.to_string(), "retryAfter": 1 }),
            ),
            ApiError::Store(_) => (
                StatusCode::BAD_GATEWAY,
                json!({ "error": self.code(), "message": self.to_string() }),
            ),
            ApiError::Queue(_) | ApiError::Db(_) => {
                tracing::error!("internal error: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": self.code(), "message": "internal server error" }),
                )
            }
        };

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::TOO_MANY_REQUESTS {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("1"));
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            ApiError::Validation("bad".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::NotFound("video x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::TooLarge {
                declared: 11,
                max: 10
            }
            .into_response()
            .status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::Store(StoreError::Throttled("slow".into()))
                .into_response()
                .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::StateConflict {
                current: VideoStatus::Processing
            }
            .into_response()
            .status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn throttled_carries_retry_after() {
        let resp = ApiError::Store(StoreError::Throttled("slow".into())).into_response();
        assert!(resp.headers().contains_key(header::RETRY_AFTER));
    }
}
