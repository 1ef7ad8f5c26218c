//! Typed access to the relational source of truth.
//!
//! All lifecycle mutations go through compare-and-swap updates
//! (`UPDATE … WHERE id = ? AND status = ?`) so concurrent replicas serialize
//! per-video transitions without cross-video locks. A CAS that matched zero
//! rows means another actor advanced the row first; callers treat that as a
//! conflict or a no-op, never as an error to retry blindly.

#![allow(dead_code)] // Some accessors exist for the worker binary and tests

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, Value,
};

use crate::db::entities::upload_session::{self, SessionStatus};
use crate::db::entities::video::{self, VideoStatus};
use crate::db::entities::{segment, upload_session::PartRecord};

/// Mint a 128-bit opaque identifier (32-char lowercase hex, url-safe).
pub fn new_object_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Clone)]
pub struct MetadataStore {
    db: DatabaseConnection,
}

impl MetadataStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// The underlying connection, for transactional sections that span the
    /// metadata store and the job queue.
    pub fn conn(&self) -> &DatabaseConnection {
        &self.db
    }

    // ------------------------------------------------------------------
    // Videos
    // ------------------------------------------------------------------

    pub async fn insert_video(&self, model: video::ActiveModel) -> Result<video::Model, DbErr> {
        model.insert(&self.db).await
    }

    pub async fn video(&self, id: &str) -> Result<Option<video::Model>, DbErr> {
        video::Entity::find_by_id(id).one(&self.db).await
    }

    /// Non-deleted videos, newest first. `before` pages by creation time.
    pub async fn list_videos(
        &self,
        limit: u64,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<video::Model>, DbErr> {
        let mut query = video::Entity::find()
            .filter(video::Column::Status.ne(VideoStatus::Deleted.as_str()))
            .filter(video::Column::DeletedAt.is_null());
        if let Some(cursor) = before {
            query = query.filter(video::Column::CreatedAt.lt(cursor));
        }
        query
            .order_by_desc(video::Column::CreatedAt)
            .limit(limit)
            .all(&self.db)
            .await
    }

    /// Compare-and-swap status advance. Returns false when the row was not in
    /// `from` (someone else advanced it; the caller decides what that means).
    /// `extra` columns are applied in the same statement.
    pub async fn advance_video_status<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &str,
        from: VideoStatus,
        to: VideoStatus,
        extra: Vec<(video::Column, Value)>,
    ) -> Result<bool, DbErr> {
        let mut update = video::Entity::update_many()
            .col_expr(video::Column::Status, Expr::value(to.as_str()))
            .col_expr(video::Column::UpdatedAt, Expr::value(Utc::now()));
        for (col, value) in extra {
            update = update.col_expr(col, Expr::value(value));
        }
        let result = update
            .filter(video::Column::Id.eq(id))
            .filter(video::Column::Status.eq(from.as_str()))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// `from → failed` with `last_error` recorded.
    pub async fn fail_video(
        &self,
        id: &str,
        from: VideoStatus,
        error: &str,
    ) -> Result<bool, DbErr> {
        self.advance_video_status(
            &self.db,
            id,
            from,
            VideoStatus::Failed,
            vec![(
                video::Column::LastError,
                Value::from(Some(error.to_string())),
            )],
        )
        .await
    }

    /// Bump the worker attempt counter mirrored onto the video row.
    pub async fn bump_processing_attempts(&self, id: &str) -> Result<(), DbErr> {
        video::Entity::update_many()
            .col_expr(
                video::Column::ProcessingAttempts,
                Expr::col(video::Column::ProcessingAttempts).add(1),
            )
            .col_expr(video::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(video::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Upload sessions
    // ------------------------------------------------------------------

    pub async fn insert_session(
        &self,
        model: upload_session::ActiveModel,
    ) -> Result<upload_session::Model, DbErr> {
        model.insert(&self.db).await
    }

    pub async fn session(&self, id: &str) -> Result<Option<upload_session::Model>, DbErr> {
        upload_session::Entity::find_by_id(id).one(&self.db).await
    }

    /// Most recent session for a video.
    pub async fn session_for_video(
        &self,
        video_id: &str,
    ) -> Result<Option<upload_session::Model>, DbErr> {
        upload_session::Entity::find()
            .filter(upload_session::Column::VideoId.eq(video_id))
            .order_by_desc(upload_session::Column::CreatedAt)
            .one(&self.db)
            .await
    }

    pub async fn session_by_multipart_id(
        &self,
        multipart_upload_id: &str,
    ) -> Result<Option<upload_session::Model>, DbErr> {
        upload_session::Entity::find()
            .filter(upload_session::Column::MultipartUploadId.eq(multipart_upload_id))
            .one(&self.db)
            .await
    }

    pub async fn update_session_parts(
        &self,
        id: &str,
        parts: &[PartRecord],
    ) -> Result<(), DbErr> {
        upload_session::Entity::update_many()
            .col_expr(
                upload_session::Column::UploadedParts,
                Expr::value(upload_session::encode_parts(parts)),
            )
            .filter(upload_session::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn refresh_session_expiry(
        &self,
        id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DbErr> {
        upload_session::Entity::update_many()
            .col_expr(upload_session::Column::ExpiresAt, Expr::value(expires_at))
            .filter(upload_session::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Active sessions created before `cutoff`, for the collector's
    /// dangling-row reconcile.
    pub async fn stale_active_sessions(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<upload_session::Model>, DbErr> {
        upload_session::Entity::find()
            .filter(upload_session::Column::Status.eq(SessionStatus::Active.as_str()))
            .filter(upload_session::Column::CreatedAt.lt(cutoff))
            .all(&self.db)
            .await
    }

    /// CAS the session out of `active`. Completion additionally stamps
    /// `completed_at`.
    pub async fn close_session<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: &str,
        to: SessionStatus,
    ) -> Result<bool, DbErr> {
        let mut update = upload_session::Entity::update_many()
            .col_expr(upload_session::Column::Status, Expr::value(to.as_str()));
        if to == SessionStatus::Completed {
            update = update.col_expr(
                upload_session::Column::CompletedAt,
                Expr::value(Some(Utc::now())),
            );
        }
        let result = update
            .filter(upload_session::Column::Id.eq(id))
            .filter(upload_session::Column::Status.eq(SessionStatus::Active.as_str()))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    // ------------------------------------------------------------------
    // Segments (worker-written, read-only here)
    // ------------------------------------------------------------------

    pub async fn segments_for(&self, video_id: &str) -> Result<Vec<segment::Model>, DbErr> {
        segment::Entity::find()
            .filter(segment::Column::VideoId.eq(video_id))
            .order_by_asc(segment::Column::Idx)
            .all(&self.db)
            .await
    }

    pub async fn segment_count(&self, video_id: &str) -> Result<u64, DbErr> {
        segment::Entity::find()
            .filter(segment::Column::VideoId.eq(video_id))
            .count(&self.db)
            .await
    }
}

/// Convenience constructor for a new pending-upload video row.
#[allow(clippy::too_many_arguments)]
pub fn new_video(
    id: &str,
    title: &str,
    source_url: &str,
    source_size: u64,
    source_checksum: Option<String>,
    content_type: &str,
    upload_session_id: Option<String>,
    is_public: bool,
) -> video::ActiveModel {
    let now = Utc::now();
    video::ActiveModel {
        id: Set(id.to_string()),
        title: Set(title.to_string()),
        status: Set(VideoStatus::PendingUpload.as_str().to_string()),
        source_url: Set(source_url.to_string()),
        source_size: Set(source_size as i64),
        source_checksum: Set(source_checksum),
        content_type: Set(content_type.to_string()),
        manifest_url: Set(None),
        duration_s: Set(None),
        width: Set(None),
        height: Set(None),
        codec: Set(None),
        bitrate: Set(None),
        fps: Set(None),
        thumbnails: Set(None),
        upload_session_id: Set(upload_session_id),
        processing_attempts: Set(0),
        last_error: Set(None),
        is_public: Set(is_public),
        created_at: Set(now),
        updated_at: Set(now),
        processed_at: Set(None),
        cancelled_at: Set(None),
        deleted_at: Set(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;

    async fn store() -> (tempfile::TempDir, MetadataStore) {
        let (dir, db) = temp_db().await;
        (dir, MetadataStore::new(db))
    }

    fn sample_video(id: &str) -> video::ActiveModel {
        new_video(
            id,
            "clip",
            &format!("s3://media/sources/{}/original.mp4", id),
            1024,
            None,
            "video/mp4",
            None,
            false,
        )
    }

    #[tokio::test]
    async fn cas_advance_is_exactly_once() {
        let (_dir, meta) = store().await;
        let v = meta.insert_video(sample_video("v1")).await.unwrap();
        assert_eq!(v.status(), VideoStatus::PendingUpload);

        let first = meta
            .advance_video_status(
                meta.conn(),
                "v1",
                VideoStatus::PendingUpload,
                VideoStatus::Processing,
                vec![],
            )
            .await
            .unwrap();
        assert!(first);

        // Second CAS from the same expected state loses.
        let second = meta
            .advance_video_status(
                meta.conn(),
                "v1",
                VideoStatus::PendingUpload,
                VideoStatus::Processing,
                vec![],
            )
            .await
            .unwrap();
        assert!(!second);

        let v = meta.video("v1").await.unwrap().unwrap();
        assert_eq!(v.status(), VideoStatus::Processing);
    }

    #[tokio::test]
    async fn fail_video_records_error() {
        let (_dir, meta) = store().await;
        meta.insert_video(sample_video("v1")).await.unwrap();
        assert!(meta
            .fail_video("v1", VideoStatus::PendingUpload, "upload expired")
            .await
            .unwrap());
        let v = meta.video("v1").await.unwrap().unwrap();
        assert_eq!(v.status(), VideoStatus::Failed);
        assert_eq!(v.last_error.as_deref(), Some("upload expired"));
    }

    #[tokio::test]
    async fn listing_excludes_deleted() {
        let (_dir, meta) = store().await;
        meta.insert_video(sample_video("keep")).await.unwrap();
        meta.insert_video(sample_video("gone")).await.unwrap();
        meta.advance_video_status(
            meta.conn(),
            "gone",
            VideoStatus::PendingUpload,
            VideoStatus::Deleted,
            vec![(video::Column::DeletedAt, Value::from(Some(Utc::now())))],
        )
        .await
        .unwrap();

        let listed = meta.list_videos(100, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "keep");
    }

    #[tokio::test]
    async fn session_close_is_cas_guarded() {
        let (_dir, meta) = store().await;
        meta.insert_video(sample_video("v1")).await.unwrap();
        let now = Utc::now();
        meta.insert_session(upload_session::ActiveModel {
            id: Set("s1".into()),
            video_id: Set("v1".into()),
            multipart_upload_id: Set(Some("mp1".into())),
            total_parts: Set(6),
            part_size: Set(50 * 1024 * 1024),
            uploaded_parts: Set("[]".into()),
            status: Set(SessionStatus::Active.as_str().into()),
            expires_at: Set(now + chrono::Duration::hours(1)),
            created_at: Set(now),
            completed_at: Set(None),
        })
        .await
        .unwrap();

        assert!(meta
            .close_session(meta.conn(), "s1", SessionStatus::Completed)
            .await
            .unwrap());
        // Already closed; the CAS misses.
        assert!(!meta
            .close_session(meta.conn(), "s1", SessionStatus::Expired)
            .await
            .unwrap());

        let s = meta.session("s1").await.unwrap().unwrap();
        assert_eq!(s.status(), SessionStatus::Completed);
        assert!(s.completed_at.is_some());
    }

    #[tokio::test]
    async fn worker_written_segments_are_readable() {
        let (_dir, meta) = store().await;
        meta.insert_video(sample_video("v1")).await.unwrap();

        for (idx, start) in [(1, 4.0), (0, 0.0)] {
            segment::ActiveModel {
                video_id: Set("v1".into()),
                idx: Set(idx),
                url: Set(format!("s3://media/processed/v1/720p/seg_{}.m4s", idx)),
                start_s: Set(start),
                duration_s: Set(4.0),
                size: Set(Some(1_000_000)),
                keyframe: Set(Some(idx == 0)),
            }
            .insert(meta.conn())
            .await
            .unwrap();
        }

        assert_eq!(meta.segment_count("v1").await.unwrap(), 2);
        let segments = meta.segments_for("v1").await.unwrap();
        assert_eq!(segments[0].idx, 0);
        assert_eq!(segments[1].idx, 1);
        assert_eq!(meta.segment_count("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn part_registry_round_trips_through_session_row() {
        let (_dir, meta) = store().await;
        meta.insert_video(sample_video("v1")).await.unwrap();
        let now = Utc::now();
        meta.insert_session(upload_session::ActiveModel {
            id: Set("s1".into()),
            video_id: Set("v1".into()),
            multipart_upload_id: Set(Some("mp1".into())),
            total_parts: Set(2),
            part_size: Set(50 * 1024 * 1024),
            uploaded_parts: Set("[]".into()),
            status: Set(SessionStatus::Active.as_str().into()),
            expires_at: Set(now + chrono::Duration::hours(1)),
            created_at: Set(now),
            completed_at: Set(None),
        })
        .await
        .unwrap();

        let parts = vec![PartRecord {
            part_number: 1,
            etag: None,
            checksum: Some("c2hhMjU2".into()),
            size: Some(123),
        }];
        meta.update_session_parts("s1", &parts).await.unwrap();
        let s = meta.session("s1").await.unwrap().unwrap();
        assert_eq!(s.parts(), parts);
        assert_eq!(s.registered_checksums().len(), 1);
    }
}
