//! Request/response marshalling over the lifecycle controller and session
//! manager. Bodies are strict: unknown fields are rejected at the boundary.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::entities::video::{self, ThumbnailDescriptor, VideoStatus};
use crate::error::{ApiError, Result};
use crate::fanout::FanoutService;
use crate::lifecycle::LifecycleController;
use crate::metadata::MetadataStore;
use crate::store::{keys, ObjectStore, StoreError};
use crate::upload::{
    CompletionRequest, MintedSession, NewUpload, PartChecksum, UploadSessionManager,
};

const DEFAULT_PAGE_SIZE: u64 = 50;
const MAX_PAGE_SIZE: u64 = 100;

/// Application state shared across handlers
pub struct AppState {
    pub meta: MetadataStore,
    pub store: Arc<dyn ObjectStore>,
    pub fanout: Arc<FanoutService>,
    pub sessions: UploadSessionManager,
    pub lifecycle: Arc<LifecycleController>,
}

// ----------------------------------------------------------------------
// Wire types
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateUploadRequest {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    /// Base64 SHA-256 over the whole source (single-PUT uploads).
    pub checksum: Option<String>,
    pub title: Option<String>,
    pub is_public: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum CreateUploadResponse {
    #[serde(rename = "single")]
    Single {
        upload_id: String,
        upload_url: String,
        expires_at: DateTime<Utc>,
    },
    #[serde(rename = "multipart")]
    Multipart {
        upload_id: String,
        multipart_upload_id: String,
        part_urls: Vec<String>,
        part_size: u64,
        num_parts: u32,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshUrlsResponse {
    pub part_urls: Vec<String>,
    pub part_size: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PartChecksumsRequest {
    pub parts: Vec<PartChecksumEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PartChecksumEntry {
    pub part_number: u32,
    pub checksum: String,
    pub size: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct PartChecksumsResponse {
    pub accepted: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CompleteUploadRequest {
    pub multipart_upload_id: Option<String>,
    #[serde(default)]
    pub parts: Vec<CompletedPartEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CompletedPartEntry {
    #[serde(alias = "PartNumber")]
    pub part_number: u32,
    #[serde(alias = "ETag")]
    pub etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    pub video_id: String,
    pub status: VideoStatus,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub video_id: String,
    pub status: VideoStatus,
    pub title: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSummary {
    pub id: String,
    pub title: String,
    pub status: VideoStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&video::Model> for VideoSummary {
    fn from(v: &video::Model) -> Self {
        Self {
            id: v.id.clone(),
            title: v.title.clone(),
            status: v.status(),
            duration_s: v.duration_s,
            width: v.width,
            height: v.height,
            is_public: v.is_public,
            created_at: v.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListVideosResponse {
    pub videos: Vec<VideoSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetailResponse {
    #[serde(flatten)]
    pub summary: VideoSummary,
    pub source_size: i64,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnails: Option<ThumbnailDescriptor>,
    pub processing_attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ListQuery {
    pub limit: Option<u64>,
    /// Return videos created strictly before this timestamp.
    pub before: Option<DateTime<Utc>>,
}

// ----------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------

/// POST /uploads - create a video and mint its upload session
pub async fn create_upload(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUploadRequest>,
) -> Result<Json<CreateUploadResponse>> {
    let created = state
        .sessions
        .create(NewUpload {
            filename: req.filename,
            content_type: req.content_type,
            size: req.size,
            checksum: req.checksum,
            title: req.title,
            is_public: req.is_public.unwrap_or(false),
        })
        .await?;

    let upload_id = created.video.id.clone();
    let response = match created.minted {
        MintedSession::Single {
            upload_url,
            expires_at,
        } => CreateUploadResponse::Single {
            upload_id,
            upload_url,
            expires_at,
        },
        MintedSession::Multipart {
            multipart_upload_id,
            part_urls,
            part_size,
            num_parts,
            expires_at,
        } => CreateUploadResponse::Multipart {
            upload_id,
            multipart_upload_id,
            part_urls,
            part_size,
            num_parts,
            expires_at,
        },
    };
    Ok(Json(response))
}

/// POST /uploads/:id/refresh-urls - re-mint part URLs
pub async fn refresh_urls(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RefreshUrlsResponse>> {
    let refreshed = state.sessions.refresh_urls(&id).await?;
    Ok(Json(RefreshUrlsResponse {
        part_urls: refreshed.part_urls,
        part_size: refreshed.part_size,
        expires_at: refreshed.expires_at,
    }))
}

/// PATCH /uploads/:id/part-checksums - register per-part checksums
pub async fn register_part_checksums(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<PartChecksumsRequest>,
) -> Result<Json<PartChecksumsResponse>> {
    let entries = req
        .parts
        .into_iter()
        .map(|p| PartChecksum {
            part_number: p.part_number,
            checksum: p.checksum,
            size: p.size,
        })
        .collect();
    let accepted = state.sessions.register_checksums(&id, entries).await?;
    Ok(Json(PartChecksumsResponse { accepted }))
}

/// POST /uploads/:id/complete - finalize the upload
pub async fn complete_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CompleteUploadRequest>,
) -> Result<Json<CompleteUploadResponse>> {
    let video = state
        .sessions
        .complete(
            &id,
            CompletionRequest {
                multipart_upload_id: req.multipart_upload_id,
                parts: req
                    .parts
                    .into_iter()
                    .map(|p| crate::store::CompletedPart {
                        part_number: p.part_number,
                        etag: p.etag,
                    })
                    .collect(),
            },
        )
        .await?;
    Ok(Json(CompleteUploadResponse {
        video_id: video.id,
        status: VideoStatus::Processing,
    }))
}

/// POST /uploads/:id/abort - cancel the upload
pub async fn abort_upload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>> {
    state.sessions.abort(&id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// GET /uploads/:id/status - upload progress & state
pub async fn upload_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<UploadStatusResponse>> {
    let video = state
        .meta
        .video(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("video {}", id)))?;
    Ok(Json(UploadStatusResponse {
        video_id: video.id.clone(),
        status: video.status(),
        title: video.title,
    }))
}

/// GET /videos - list non-deleted videos, newest first
pub async fn list_videos(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListVideosResponse>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let videos = state.meta.list_videos(limit, query.before).await?;
    Ok(Json(ListVideosResponse {
        videos: videos.iter().map(VideoSummary::from).collect(),
    }))
}

/// GET /videos/:id - detail, with the manifest inlined once ready
pub async fn get_video(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<VideoDetailResponse>> {
    let video = state
        .meta
        .video(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("video {}", id)))?;
    if video.status() == VideoStatus::Deleted {
        return Err(ApiError::NotFound(format!("video {}", id)));
    }

    let manifest = if video.status() == VideoStatus::Ready {
        fetch_manifest(state.store.as_ref(), &id).await
    } else {
        None
    };

    let thumbnails = video.thumbnails();

    Ok(Json(VideoDetailResponse {
        summary: VideoSummary::from(&video),
        source_size: video.source_size,
        content_type: video.content_type.clone(),
        manifest_url: video.manifest_url.clone(),
        manifest,
        codec: video.codec.clone(),
        bitrate: video.bitrate,
        fps: video.fps,
        thumbnails,
        processing_attempts: video.processing_attempts,
        last_error: video.last_error.clone(),
        processed_at: video.processed_at,
    }))
}

/// Inline manifest fetch is best-effort; a storage hiccup downgrades the
/// response rather than failing it.
async fn fetch_manifest(store: &dyn ObjectStore, video_id: &str) -> Option<serde_json::Value> {
    let key = keys::manifest_key(video_id);
    let head = match store.head(&key).await {
        Ok(head) if head.size > 0 => head,
        Ok(_) => return None,
        Err(StoreError::NotFound(_)) => return None,
        Err(e) => {
            tracing::warn!("manifest head for {} failed: {}", video_id, e);
            return None;
        }
    };
    match store.range_get(&key, 0, head.size - 1).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("manifest for {} is not valid JSON: {}", video_id, e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("manifest read for {} failed: {}", video_id, e);
            None
        }
    }
}

/// DELETE /videos/:id - soft delete with best-effort source purge
pub async fn delete_video(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>> {
    state.lifecycle.delete(&id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

/// GET /healthz
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_rejects_unknown_fields() {
        let err = serde_json::from_str::<CreateUploadRequest>(
            r#"{"filename":"a.mp4","contentType":"video/mp4","size":1,"surprise":true}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("surprise"));
    }

    #[test]
    fn complete_request_accepts_provider_style_part_keys() {
        let req: CompleteUploadRequest = serde_json::from_str(
            r#"{"multipartUploadId":"m1","parts":[{"PartNumber":1,"ETag":"\"abc\""}]}"#,
        )
        .unwrap();
        assert_eq!(req.parts.len(), 1);
        assert_eq!(req.parts[0].part_number, 1);
        assert_eq!(req.parts[0].etag, "\"abc\"");

        let req: CompleteUploadRequest =
            serde_json::from_str(r#"{"parts":[{"partNumber":2,"etag":"\"def\""}]}"#).unwrap();
        assert_eq!(req.parts[0].part_number, 2);
    }

    #[test]
    fn upload_response_wire_shape() {
        let single = CreateUploadResponse::Single {
            upload_id: "v1".into(),
            upload_url: "https://example/put".into(),
            expires_at: Utc::now(),
        };
        let json = serde_json::to_value(&single).unwrap();
        assert_eq!(json["type"], "single");
        assert_eq!(json["uploadId"], "v1");

        let multi = CreateUploadResponse::Multipart {
            upload_id: "v2".into(),
            multipart_upload_id: "m1".into(),
            part_urls: vec!["u1".into(), "u2".into()],
            part_size: 50 * 1024 * 1024,
            num_parts: 2,
            expires_at: Utc::now(),
        };
        let json = serde_json::to_value(&multi).unwrap();
        assert_eq!(json["type"], "multipart");
        assert_eq!(json["numParts"], 2);
        assert_eq!(json["partUrls"].as_array().unwrap().len(), 2);
    }
}
