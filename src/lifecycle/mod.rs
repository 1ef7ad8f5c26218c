//! Video lifecycle controller.
//!
//! Owns the per-video state machine. Worker outcomes arrive as bus events and
//! are applied here under the same CAS discipline as client-driven
//! transitions, so late or duplicate worker callbacks degrade to no-ops. The
//! worker itself never writes video rows.

use sea_orm::Value;
use std::sync::Arc;

use chrono::Utc;

use crate::bus::{Bus, EventStatus, StatusEvent, TOPIC_VIDEO_STATUS};
use crate::db::entities::video::{self, VideoStatus};
use crate::error::{ApiError, Result};
use crate::metadata::MetadataStore;
use crate::queue::JobQueue;
use crate::store::{keys, ObjectStore};

/// Legal transitions of the video state machine. `deleted` is terminal;
/// `ready`, `failed`, and `cancelled` are quiescent but can still be deleted.
pub fn is_valid_transition(from: VideoStatus, to: VideoStatus) -> bool {
    use VideoStatus::*;
    matches!(
        (from, to),
        (PendingUpload, Uploading)
            | (PendingUpload, Processing)
            | (PendingUpload, Cancelled)
            | (PendingUpload, Failed)
            | (PendingUpload, Deleted)
            | (Uploading, Cancelled)
            | (Uploading, Failed)
            | (Uploading, Deleted)
            | (Processing, Ready)
            | (Processing, Failed)
            | (Processing, Deleted)
            | (Ready, Deleted)
            | (Failed, Deleted)
            | (Cancelled, Deleted)
    )
}

pub struct LifecycleController {
    meta: MetadataStore,
    store: Arc<dyn ObjectStore>,
    queue: JobQueue,
}

impl LifecycleController {
    pub fn new(meta: MetadataStore, store: Arc<dyn ObjectStore>, queue: JobQueue) -> Self {
        Self { meta, store, queue }
    }

    /// Soft delete: stamp `deleted_at`, then best-effort removal of the
    /// source object and manifest. Idempotent on repeat.
    pub async fn delete(&self, video_id: &str) -> Result<()> {
        let video = self
            .meta
            .video(video_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("video {}", video_id)))?;

        let from = video.status();
        if from == VideoStatus::Deleted {
            return Ok(());
        }

        let advanced = self
            .meta
            .advance_video_status(
                self.meta.conn(),
                video_id,
                from,
                VideoStatus::Deleted,
                vec![(video::Column::DeletedAt, Value::from(Some(Utc::now())))],
            )
            .await?;
        if !advanced {
            // Someone advanced the row between the read and the CAS; deletion
            // is legal from every state, so retry once from wherever it is.
            let current = self
                .meta
                .video(video_id)
                .await?
                .map(|v| v.status())
                .unwrap_or(VideoStatus::Deleted);
            if current != VideoStatus::Deleted {
                self.meta
                    .advance_video_status(
                        self.meta.conn(),
                        video_id,
                        current,
                        VideoStatus::Deleted,
                        vec![(video::Column::DeletedAt, Value::from(Some(Utc::now())))],
                    )
                    .await?;
            }
        }

        if let Some((_, key)) = keys::parse_source_url(&video.source_url) {
            if let Err(e) = self.store.delete(key).await {
                tracing::warn!("best-effort source delete of {} failed: {}", key, e);
            }
        }
        let manifest = keys::manifest_key(video_id);
        if let Err(e) = self.store.delete(&manifest).await {
            tracing::warn!("best-effort manifest delete of {} failed: {}", manifest, e);
        }

        tracing::info!("video {} deleted (was {})", video_id, from);
        Ok(())
    }

    /// Apply one worker-emitted status event under the per-video CAS.
    pub async fn apply_worker_event(&self, event: &StatusEvent) -> Result<()> {
        match event.status {
            EventStatus::Processing => {
                // The worker started (another) attempt.
                self.meta.bump_processing_attempts(&event.video_id).await?;
            }
            EventStatus::Ready => {
                let Some(media) = &event.media else {
                    tracing::error!(
                        "worker reported {} ready without media facts",
                        event.video_id
                    );
                    self.meta
                        .fail_video(
                            &event.video_id,
                            VideoStatus::Processing,
                            "worker reported ready without manifest",
                        )
                        .await?;
                    return Ok(());
                };
                // A ready video must have at least one playable segment.
                if self.meta.segment_count(&event.video_id).await? == 0 {
                    tracing::error!(
                        "worker reported {} ready with no segments",
                        event.video_id
                    );
                    self.meta
                        .fail_video(
                            &event.video_id,
                            VideoStatus::Processing,
                            "worker reported ready without segments",
                        )
                        .await?;
                    return Ok(());
                }
                let advanced = self
                    .meta
                    .advance_video_status(
                        self.meta.conn(),
                        &event.video_id,
                        VideoStatus::Processing,
                        VideoStatus::Ready,
                        vec![
                            (
                                video::Column::ManifestUrl,
                                Value::from(Some(media.manifest_url.clone())),
                            ),
                            (video::Column::DurationS, Value::from(Some(media.duration_s))),
                            (video::Column::Width, Value::from(media.width)),
                            (video::Column::Height, Value::from(media.height)),
                            (video::Column::Codec, Value::from(media.codec.clone())),
                            (video::Column::Bitrate, Value::from(media.bitrate)),
                            (video::Column::Fps, Value::from(media.fps)),
                            (video::Column::ProcessedAt, Value::from(Some(Utc::now()))),
                        ],
                    )
                    .await?;
                if advanced {
                    tracing::info!("video {} -> ready", event.video_id);
                } else {
                    tracing::debug!(
                        "ignoring late/duplicate ready event for {}",
                        event.video_id
                    );
                }
            }
            EventStatus::Failed => {
                let error = event.error.as_deref().unwrap_or("transcoding failed");
                let advanced = self
                    .meta
                    .fail_video(&event.video_id, VideoStatus::Processing, error)
                    .await?;
                if advanced {
                    tracing::warn!("video {} -> failed: {}", event.video_id, error);
                } else {
                    tracing::debug!(
                        "ignoring late/duplicate failure event for {}",
                        event.video_id
                    );
                }
            }
        }
        Ok(())
    }

    /// Videos stuck in `processing` whose job landed in the dead letter set
    /// are failed here. Covers workers that died without publishing.
    pub async fn reconcile_exhausted_jobs(&self) -> Result<u64> {
        let mut failed = 0;
        for job in self.queue.dead_jobs().await.map_err(ApiError::Db)? {
            let Some(video) = self.meta.video(&job.video_id).await? else {
                continue;
            };
            if video.status() != VideoStatus::Processing {
                continue;
            }
            let error = job
                .last_error
                .clone()
                .unwrap_or_else(|| "transcoding failed".to_string());
            let advanced = self
                .meta
                .advance_video_status(
                    self.meta.conn(),
                    &job.video_id,
                    VideoStatus::Processing,
                    VideoStatus::Failed,
                    vec![
                        (
                            video::Column::LastError,
                            Value::from(Some(format!(
                                "{} ({} attempts)",
                                error, job.attempts
                            ))),
                        ),
                        // The queue's attempt count is authoritative; mirror it.
                        (
                            video::Column::ProcessingAttempts,
                            Value::from(job.attempts),
                        ),
                    ],
                )
                .await?;
            if advanced {
                failed += 1;
                tracing::warn!(
                    "video {} failed after {} exhausted attempts",
                    job.video_id,
                    job.attempts
                );
            }
        }
        Ok(failed)
    }

    /// Consume worker events off the bus until the task is aborted.
    pub fn spawn_event_consumer(self: &Arc<Self>, bus: Arc<Bus>) -> tokio::task::JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut rx = bus.subscribe(TOPIC_VIDEO_STATUS);
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = controller.apply_worker_event(&event).await {
                            tracing::error!(
                                "failed to apply worker event for {}: {}",
                                event.video_id,
                                e
                            );
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("lifecycle consumer lagged by {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MediaInfo;
    use crate::db::entities::segment;
    use crate::db::test_support::temp_db;
    use crate::metadata::new_video;
    use crate::queue::TranscodeJobPayload;
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use sea_orm::{ActiveModelTrait, Set};
    use std::time::Duration;

    #[test]
    fn transition_table_matches_diagram() {
        use VideoStatus::*;
        // Forward edges.
        assert!(is_valid_transition(PendingUpload, Processing));
        assert!(is_valid_transition(Processing, Ready));
        assert!(is_valid_transition(Processing, Failed));
        assert!(is_valid_transition(PendingUpload, Cancelled));
        assert!(is_valid_transition(PendingUpload, Failed));
        for quiescent in [Ready, Failed, Cancelled] {
            assert!(is_valid_transition(quiescent, Deleted));
        }
        // Illegal edges.
        assert!(!is_valid_transition(Ready, Processing));
        assert!(!is_valid_transition(Failed, Ready));
        assert!(!is_valid_transition(Deleted, PendingUpload));
        assert!(!is_valid_transition(Cancelled, Processing));
        assert!(!is_valid_transition(Processing, PendingUpload));
    }

    struct Harness {
        _dir: tempfile::TempDir,
        meta: MetadataStore,
        queue: JobQueue,
        store: Arc<MemoryStore>,
        controller: LifecycleController,
    }

    async fn harness() -> Harness {
        let (dir, db) = temp_db().await;
        let meta = MetadataStore::new(db.clone());
        let queue = JobQueue::new(db, 1, Duration::from_secs(5));
        let store = Arc::new(MemoryStore::new());
        let controller = LifecycleController::new(meta.clone(), store.clone(), queue.clone());
        Harness {
            _dir: dir,
            meta,
            queue,
            store,
            controller,
        }
    }

    async fn processing_video(h: &Harness, id: &str) {
        h.meta
            .insert_video(new_video(
                id,
                "clip",
                &format!("s3://media/sources/{}/original.mp4", id),
                100,
                None,
                "video/mp4",
                None,
                false,
            ))
            .await
            .unwrap();
        assert!(h
            .meta
            .advance_video_status(
                h.meta.conn(),
                id,
                VideoStatus::PendingUpload,
                VideoStatus::Processing,
                vec![],
            )
            .await
            .unwrap());
    }

    /// Simulate the worker having written one output segment.
    async fn seed_segment(h: &Harness, video_id: &str) {
        segment::ActiveModel {
            video_id: Set(video_id.to_string()),
            idx: Set(0),
            url: Set(format!("s3://media/processed/{}/720p/seg_0.m4s", video_id)),
            start_s: Set(0.0),
            duration_s: Set(4.0),
            size: Set(Some(1_000_000)),
            keyframe: Set(Some(true)),
        }
        .insert(h.meta.conn())
        .await
        .unwrap();
    }

    fn media() -> MediaInfo {
        MediaInfo {
            manifest_url: "s3://media/processed/v1/manifest.json".into(),
            duration_s: 42.5,
            width: Some(1920),
            height: Some(1080),
            codec: Some("h264".into()),
            bitrate: Some(4_000_000),
            fps: Some(29.97),
        }
    }

    #[tokio::test]
    async fn ready_event_sets_derived_fields_once() {
        let h = harness().await;
        processing_video(&h, "v1").await;
        seed_segment(&h, "v1").await;

        let event = StatusEvent::ready("v1", media());
        h.controller.apply_worker_event(&event).await.unwrap();

        let video = h.meta.video("v1").await.unwrap().unwrap();
        assert_eq!(video.status(), VideoStatus::Ready);
        assert_eq!(
            video.manifest_url.as_deref(),
            Some("s3://media/processed/v1/manifest.json")
        );
        assert_eq!(video.duration_s, Some(42.5));
        assert!(video.processed_at.is_some());

        // A duplicate terminal event is a no-op.
        h.controller.apply_worker_event(&event).await.unwrap();
        let again = h.meta.video("v1").await.unwrap().unwrap();
        assert_eq!(again.status(), VideoStatus::Ready);
    }

    #[tokio::test]
    async fn ready_without_media_fails_the_video() {
        let h = harness().await;
        processing_video(&h, "v1").await;
        seed_segment(&h, "v1").await;

        let mut event = StatusEvent::processing("v1");
        event.status = EventStatus::Ready;
        h.controller.apply_worker_event(&event).await.unwrap();

        let video = h.meta.video("v1").await.unwrap().unwrap();
        assert_eq!(video.status(), VideoStatus::Failed);
    }

    #[tokio::test]
    async fn ready_without_segments_fails_the_video() {
        let h = harness().await;
        processing_video(&h, "v1").await;

        // No segment rows were written; the ready report is not honored.
        h.controller
            .apply_worker_event(&StatusEvent::ready("v1", media()))
            .await
            .unwrap();

        let video = h.meta.video("v1").await.unwrap().unwrap();
        assert_eq!(video.status(), VideoStatus::Failed);
        assert_eq!(
            video.last_error.as_deref(),
            Some("worker reported ready without segments")
        );
        assert!(video.manifest_url.is_none());

        // With segments present, a fresh video does advance.
        processing_video(&h, "v2").await;
        seed_segment(&h, "v2").await;
        h.controller
            .apply_worker_event(&StatusEvent::ready("v2", media()))
            .await
            .unwrap();
        assert_eq!(
            h.meta.video("v2").await.unwrap().unwrap().status(),
            VideoStatus::Ready
        );
    }

    #[tokio::test]
    async fn failure_event_records_last_error() {
        let h = harness().await;
        processing_video(&h, "v1").await;

        h.controller
            .apply_worker_event(&StatusEvent::failed("v1", "codec exploded"))
            .await
            .unwrap();

        let video = h.meta.video("v1").await.unwrap().unwrap();
        assert_eq!(video.status(), VideoStatus::Failed);
        assert_eq!(video.last_error.as_deref(), Some("codec exploded"));
    }

    #[tokio::test]
    async fn processing_events_count_attempts() {
        let h = harness().await;
        processing_video(&h, "v1").await;

        h.controller
            .apply_worker_event(&StatusEvent::processing("v1"))
            .await
            .unwrap();
        h.controller
            .apply_worker_event(&StatusEvent::processing("v1"))
            .await
            .unwrap();

        let video = h.meta.video("v1").await.unwrap().unwrap();
        assert_eq!(video.processing_attempts, 2);
    }

    #[tokio::test]
    async fn delete_is_soft_and_best_effort_on_objects() {
        let h = harness().await;
        processing_video(&h, "v1").await;
        h.store
            .put_object("sources/v1/original.mp4", Bytes::from_static(b"bytes"))
            .unwrap();

        h.controller.delete("v1").await.unwrap();
        let video = h.meta.video("v1").await.unwrap().unwrap();
        assert_eq!(video.status(), VideoStatus::Deleted);
        assert!(video.deleted_at.is_some());
        assert!(!h.store.object_exists("sources/v1/original.mp4"));

        // Deleted rows vanish from listings; repeat delete is a no-op.
        assert!(h.meta.list_videos(10, None).await.unwrap().is_empty());
        h.controller.delete("v1").await.unwrap();
    }

    #[tokio::test]
    async fn dead_jobs_fail_their_videos() {
        let h = harness().await;
        processing_video(&h, "v1").await;

        let payload = TranscodeJobPayload {
            video_id: "v1".into(),
            source_url: "s3://media/sources/v1/original.mp4".into(),
        };
        h.queue
            .enqueue_transcode(h.meta.conn(), &payload, 0)
            .await
            .unwrap();
        let job = h.queue.claim_next().await.unwrap().unwrap();
        // max_attempts is 1 in this harness, so one failure is terminal.
        h.queue.fail(&job.id, "worker crashed").await.unwrap();

        assert_eq!(h.controller.reconcile_exhausted_jobs().await.unwrap(), 1);
        let video = h.meta.video("v1").await.unwrap().unwrap();
        assert_eq!(video.status(), VideoStatus::Failed);
        assert_eq!(video.processing_attempts, 1);
        assert!(video.last_error.as_deref().unwrap().contains("worker crashed"));

        // Second reconcile changes nothing.
        assert_eq!(h.controller.reconcile_exhausted_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn consumer_applies_bus_events() {
        let h = harness().await;
        processing_video(&h, "v1").await;
        seed_segment(&h, "v1").await;

        let bus = Arc::new(Bus::new(16));
        let controller = Arc::new(h.controller);
        let handle = controller.spawn_event_consumer(bus.clone());

        bus.publish(TOPIC_VIDEO_STATUS, StatusEvent::ready("v1", media()));

        // The consumer runs on its own task; poll briefly for the effect.
        let mut status = VideoStatus::Processing;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = h.meta.video("v1").await.unwrap().unwrap().status();
            if status == VideoStatus::Ready {
                break;
            }
        }
        assert_eq!(status, VideoStatus::Ready);
        handle.abort();
    }
}
