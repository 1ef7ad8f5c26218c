//! Video entity: one row per ingested video, owned by the lifecycle
//! controller. Status strings are the snake_case wire values.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "videos")]
pub struct Model {
    /// 32-char lowercase hex, url-safe, assigned on creation.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub title: String,
    pub status: String,
    /// Canonical URI of the uploaded source object; immutable after creation.
    pub source_url: String,
    pub source_size: i64,
    /// Base64 SHA-256 over the whole source, for single-PUT uploads.
    pub source_checksum: Option<String>,
    pub content_type: String,
    pub manifest_url: Option<String>,
    pub duration_s: Option<f64>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub codec: Option<String>,
    pub bitrate: Option<i64>,
    pub fps: Option<f64>,
    /// JSON thumbnail descriptor, see [`ThumbnailDescriptor`].
    pub thumbnails: Option<String>,
    pub upload_session_id: Option<String>,
    pub processing_attempts: i32,
    pub last_error: Option<String>,
    pub is_public: bool,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
    pub processed_at: Option<ChronoDateTimeUtc>,
    pub cancelled_at: Option<ChronoDateTimeUtc>,
    pub deleted_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::upload_session::Entity")]
    UploadSessions,
    #[sea_orm(has_many = "super::segment::Entity")]
    Segments,
}

impl Related<super::upload_session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UploadSessions.def()
    }
}

impl Related<super::segment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Segments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Lifecycle states of a video. Transition legality lives in
/// `crate::lifecycle`; this is just the value set and its wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    PendingUpload,
    Uploading,
    Processing,
    Ready,
    Failed,
    Cancelled,
    Deleted,
}

impl VideoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoStatus::PendingUpload => "pending_upload",
            VideoStatus::Uploading => "uploading",
            VideoStatus::Processing => "processing",
            VideoStatus::Ready => "ready",
            VideoStatus::Failed => "failed",
            VideoStatus::Cancelled => "cancelled",
            VideoStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_upload" => Some(VideoStatus::PendingUpload),
            "uploading" => Some(VideoStatus::Uploading),
            "processing" => Some(VideoStatus::Processing),
            "ready" => Some(VideoStatus::Ready),
            "failed" => Some(VideoStatus::Failed),
            "cancelled" => Some(VideoStatus::Cancelled),
            "deleted" => Some(VideoStatus::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thumbnail output descriptor populated by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThumbnailDescriptor {
    pub pattern: String,
    pub interval_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sprite: Option<String>,
}

impl Model {
    pub fn status(&self) -> VideoStatus {
        // Rows are only ever written through VideoStatus::as_str.
        VideoStatus::parse(&self.status).unwrap_or(VideoStatus::Failed)
    }

    pub fn thumbnails(&self) -> Option<ThumbnailDescriptor> {
        self.thumbnails
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            VideoStatus::PendingUpload,
            VideoStatus::Uploading,
            VideoStatus::Processing,
            VideoStatus::Ready,
            VideoStatus::Failed,
            VideoStatus::Cancelled,
            VideoStatus::Deleted,
        ] {
            assert_eq!(VideoStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(VideoStatus::parse("bogus"), None);
    }
}
