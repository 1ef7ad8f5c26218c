//! Abandoned-upload collector.
//!
//! Periodic sweep that aborts multipart uploads stuck past the abandonment
//! TTL and reconciles their session and video rows. Every mutation is CAS
//! guarded, so the sweep is idempotent and safe against a client completing
//! concurrently: an upload that is no longer listable is simply skipped.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;

use crate::config::Config;
use crate::db::entities::upload_session::SessionStatus;
use crate::db::entities::video::VideoStatus;
use crate::error::Result;
use crate::lifecycle::LifecycleController;
use crate::metadata::MetadataStore;
use crate::queue::JobQueue;
use crate::store::{keys, ObjectStore};

const EXPIRED_LAST_ERROR: &str = "upload expired";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub uploads_aborted: u64,
    pub sessions_expired: u64,
    pub videos_failed: u64,
}

pub struct AbandonedUploadCollector {
    store: Arc<dyn ObjectStore>,
    meta: MetadataStore,
    queue: JobQueue,
    controller: Arc<LifecycleController>,
    config: Arc<Config>,
}

impl AbandonedUploadCollector {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        meta: MetadataStore,
        queue: JobQueue,
        controller: Arc<LifecycleController>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            meta,
            queue,
            controller,
            config,
        }
    }

    /// One full sweep over provider state and session rows.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.config.abandoned_ttl).unwrap_or_default();

        let uploads = self
            .store
            .list_incomplete_multipart(Some(keys::SOURCES_PREFIX))
            .await?;
        for upload in uploads {
            let Some(initiated_at) = upload.initiated_at else {
                continue;
            };
            if initiated_at >= cutoff {
                continue;
            }

            if let Err(e) = self
                .store
                .abort_multipart(&upload.key, &upload.upload_id)
                .await
            {
                // Likely completed or aborted between list and abort.
                tracing::debug!(
                    "skipping {} ({}): abort failed: {}",
                    upload.key,
                    upload.upload_id,
                    e
                );
                continue;
            }
            report.uploads_aborted += 1;
            tracing::info!(
                "aborted abandoned multipart upload {} on {}",
                upload.upload_id,
                upload.key
            );

            self.expire_session_rows(&upload.upload_id, &mut report)
                .await?;
        }

        // Dangling rows: sessions still active long past the TTL whose
        // provider-side upload is already gone (or never existed).
        for session in self.meta.stale_active_sessions(cutoff).await? {
            if self
                .meta
                .close_session(self.meta.conn(), &session.id, SessionStatus::Expired)
                .await?
            {
                report.sessions_expired += 1;
                if self
                    .meta
                    .fail_video(&session.video_id, VideoStatus::PendingUpload, EXPIRED_LAST_ERROR)
                    .await?
                {
                    report.videos_failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn expire_session_rows(
        &self,
        multipart_upload_id: &str,
        report: &mut SweepReport,
    ) -> Result<()> {
        let Some(session) = self.meta.session_by_multipart_id(multipart_upload_id).await? else {
            return Ok(());
        };
        if self
            .meta
            .close_session(self.meta.conn(), &session.id, SessionStatus::Expired)
            .await?
        {
            report.sessions_expired += 1;
        }
        if self
            .meta
            .fail_video(&session.video_id, VideoStatus::PendingUpload, EXPIRED_LAST_ERROR)
            .await?
        {
            report.videos_failed += 1;
        }
        Ok(())
    }

    /// Run on a schedule until the task is aborted. Each tick also prunes
    /// the job queue's terminal rows and reconciles exhausted jobs.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cadence = self.config.collector_cadence;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; a fresh replica sweeps on boot.
            loop {
                ticker.tick().await;
                match self.sweep().await {
                    Ok(report) => {
                        if report != SweepReport::default() {
                            tracing::info!(
                                "collector sweep: {} uploads aborted, {} sessions expired, {} videos failed",
                                report.uploads_aborted,
                                report.sessions_expired,
                                report.videos_failed
                            );
                        }
                    }
                    Err(e) => tracing::error!("collector sweep failed: {}", e),
                }
                if let Err(e) = self.controller.reconcile_exhausted_jobs().await {
                    tracing::error!("exhausted-job reconcile failed: {}", e);
                }
                if let Err(e) = self.queue.prune().await {
                    tracing::error!("queue prune failed: {}", e);
                }
            }
        })
    }
}
