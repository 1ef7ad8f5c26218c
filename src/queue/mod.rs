//! Durable work queue backed by the relational store.
//!
//! FIFO within a priority band, at-least-once delivery, exponential backoff
//! with a capped attempt budget, and dead-letter retention. The control plane
//! is only a producer; `claim_next`/`ack`/`fail` are the worker-facing
//! consumer API. Enqueues accept any `ConnectionTrait` so the producer can
//! make the enqueue part of the same transaction as a lifecycle transition;
//! a lost enqueue would otherwise strand a video in `processing`.

#![allow(dead_code)] // claim/ack/fail are the worker-side consumer API

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{COMPLETED_JOB_RETENTION, DEAD_JOB_RETENTION};
use crate::db::entities::transcode_job::{self, JobStatus};
use crate::metadata::new_object_id;

/// Queue consumed by the transcoder workers.
pub const QUEUE_VIDEO_PROCESSING: &str = "video-processing";

const COMPLETED_RETENTION_HOURS: i64 = 24;
const DEAD_RETENTION_DAYS: i64 = 7;

/// Job envelope for the `video-processing` queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeJobPayload {
    pub video_id: String,
    pub source_url: String,
}

/// What `fail` decided to do with the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued; claimable again at `run_at`.
    Retrying { run_at: DateTime<Utc> },
    /// Attempt budget exhausted; parked in the dead letter set.
    Dead,
}

#[derive(Clone)]
pub struct JobQueue {
    db: DatabaseConnection,
    max_attempts: u32,
    backoff_base: Duration,
}

impl JobQueue {
    pub fn new(db: DatabaseConnection, max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            db,
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    /// Enqueue a transcode job. Idempotent per video: when a queued or
    /// running job for the video already exists its id is returned and no
    /// duplicate is written. Runs on the caller's connection so it can join
    /// the lifecycle transaction.
    pub async fn enqueue_transcode<C: ConnectionTrait>(
        &self,
        conn: &C,
        payload: &TranscodeJobPayload,
        priority: i32,
    ) -> Result<String, DbErr> {
        if let Some(existing) = transcode_job::Entity::find()
            .filter(transcode_job::Column::Queue.eq(QUEUE_VIDEO_PROCESSING))
            .filter(transcode_job::Column::VideoId.eq(payload.video_id.as_str()))
            .filter(
                transcode_job::Column::Status
                    .is_in([JobStatus::Queued.as_str(), JobStatus::Running.as_str()]),
            )
            .one(conn)
            .await?
        {
            tracing::debug!(
                "transcode job for video {} already pending as {}",
                payload.video_id,
                existing.id
            );
            return Ok(existing.id);
        }

        let id = new_object_id();
        let now = Utc::now();
        transcode_job::ActiveModel {
            id: Set(id.clone()),
            queue: Set(QUEUE_VIDEO_PROCESSING.to_string()),
            video_id: Set(payload.video_id.clone()),
            payload: Set(serde_json::to_string(payload)
                .map_err(|e| DbErr::Custom(format!("payload encoding failed: {}", e)))?),
            priority: Set(priority),
            status: Set(JobStatus::Queued.as_str().to_string()),
            attempts: Set(0),
            max_attempts: Set(self.max_attempts as i32),
            run_at: Set(now),
            last_error: Set(None),
            enqueued_at: Set(now),
            started_at: Set(None),
            finished_at: Set(None),
        }
        .insert(conn)
        .await?;
        Ok(id)
    }

    /// Claim the next runnable job: highest priority first, FIFO within a
    /// band. The claim itself is a CAS so concurrent workers never double-run
    /// a job; a lost race just moves on to the next candidate.
    pub async fn claim_next(&self) -> Result<Option<transcode_job::Model>, DbErr> {
        loop {
            let candidate = transcode_job::Entity::find()
                .filter(transcode_job::Column::Status.eq(JobStatus::Queued.as_str()))
                .filter(transcode_job::Column::RunAt.lte(Utc::now()))
                .order_by_desc(transcode_job::Column::Priority)
                .order_by_asc(transcode_job::Column::EnqueuedAt)
                .one(&self.db)
                .await?;

            let Some(job) = candidate else {
                return Ok(None);
            };

            let claimed = transcode_job::Entity::update_many()
                .col_expr(
                    transcode_job::Column::Status,
                    Expr::value(JobStatus::Running.as_str()),
                )
                .col_expr(
                    transcode_job::Column::Attempts,
                    Expr::col(transcode_job::Column::Attempts).add(1),
                )
                .col_expr(transcode_job::Column::StartedAt, Expr::value(Some(Utc::now())))
                .filter(transcode_job::Column::Id.eq(job.id.as_str()))
                .filter(transcode_job::Column::Status.eq(JobStatus::Queued.as_str()))
                .exec(&self.db)
                .await?;

            if claimed.rows_affected == 1 {
                return transcode_job::Entity::find_by_id(job.id).one(&self.db).await;
            }
            // Another worker got there first; try the next candidate.
        }
    }

    /// Mark a claimed job completed.
    pub async fn ack(&self, job_id: &str) -> Result<(), DbErr> {
        transcode_job::Entity::update_many()
            .col_expr(
                transcode_job::Column::Status,
                Expr::value(JobStatus::Completed.as_str()),
            )
            .col_expr(
                transcode_job::Column::FinishedAt,
                Expr::value(Some(Utc::now())),
            )
            .filter(transcode_job::Column::Id.eq(job_id))
            .filter(transcode_job::Column::Status.eq(JobStatus::Running.as_str()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Record a failed attempt: requeue with exponential backoff while budget
    /// remains, otherwise park in the dead letter set.
    pub async fn fail(&self, job_id: &str, error: &str) -> Result<FailOutcome, DbErr> {
        let job = transcode_job::Entity::find_by_id(job_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| DbErr::Custom(format!("unknown job {}", job_id)))?;

        if job.attempts >= job.max_attempts {
            transcode_job::Entity::update_many()
                .col_expr(
                    transcode_job::Column::Status,
                    Expr::value(JobStatus::Dead.as_str()),
                )
                .col_expr(
                    transcode_job::Column::LastError,
                    Expr::value(Some(error.to_string())),
                )
                .col_expr(
                    transcode_job::Column::FinishedAt,
                    Expr::value(Some(Utc::now())),
                )
                .filter(transcode_job::Column::Id.eq(job_id))
                .exec(&self.db)
                .await?;
            tracing::warn!(
                "job {} for video {} dead after {} attempts: {}",
                job_id,
                job.video_id,
                job.attempts,
                error
            );
            return Ok(FailOutcome::Dead);
        }

        // Backoff doubles per completed attempt: base, 2*base, 4*base, ...
        let exponent = (job.attempts as u32).saturating_sub(1).min(16);
        let delay = self.backoff_base.as_secs().saturating_mul(1u64 << exponent);
        let run_at = Utc::now() + ChronoDuration::seconds(delay as i64);

        transcode_job::Entity::update_many()
            .col_expr(
                transcode_job::Column::Status,
                Expr::value(JobStatus::Queued.as_str()),
            )
            .col_expr(transcode_job::Column::RunAt, Expr::value(run_at))
            .col_expr(
                transcode_job::Column::LastError,
                Expr::value(Some(error.to_string())),
            )
            .filter(transcode_job::Column::Id.eq(job_id))
            .exec(&self.db)
            .await?;
        Ok(FailOutcome::Retrying { run_at })
    }

    /// Queued + running jobs for a video.
    pub async fn pending_depth_for(&self, video_id: &str) -> Result<u64, DbErr> {
        transcode_job::Entity::find()
            .filter(transcode_job::Column::VideoId.eq(video_id))
            .filter(
                transcode_job::Column::Status
                    .is_in([JobStatus::Queued.as_str(), JobStatus::Running.as_str()]),
            )
            .count(&self.db)
            .await
    }

    /// Dead-letter jobs, for the controller's exhaustion reconcile.
    pub async fn dead_jobs(&self) -> Result<Vec<transcode_job::Model>, DbErr> {
        transcode_job::Entity::find()
            .filter(transcode_job::Column::Status.eq(JobStatus::Dead.as_str()))
            .all(&self.db)
            .await
    }

    /// Drop finished jobs beyond the retention windows and count caps.
    pub async fn prune(&self) -> Result<u64, DbErr> {
        let mut removed = 0;
        removed += self
            .prune_terminal(
                JobStatus::Completed,
                Utc::now() - ChronoDuration::hours(COMPLETED_RETENTION_HOURS),
                COMPLETED_JOB_RETENTION,
            )
            .await?;
        removed += self
            .prune_terminal(
                JobStatus::Dead,
                Utc::now() - ChronoDuration::days(DEAD_RETENTION_DAYS),
                DEAD_JOB_RETENTION,
            )
            .await?;
        Ok(removed)
    }

    async fn prune_terminal(
        &self,
        status: JobStatus,
        cutoff: DateTime<Utc>,
        keep: u64,
    ) -> Result<u64, DbErr> {
        let aged = transcode_job::Entity::delete_many()
            .filter(transcode_job::Column::Status.eq(status.as_str()))
            .filter(transcode_job::Column::FinishedAt.lt(cutoff))
            .exec(&self.db)
            .await?
            .rows_affected;

        // Enforce the count cap on whatever the time window kept.
        let overflow: Vec<String> = transcode_job::Entity::find()
            .filter(transcode_job::Column::Status.eq(status.as_str()))
            .order_by_desc(transcode_job::Column::FinishedAt)
            .offset(keep)
            .all(&self.db)
            .await?
            .into_iter()
            .map(|j| j.id)
            .collect();

        let mut capped = 0;
        if !overflow.is_empty() {
            capped = transcode_job::Entity::delete_many()
                .filter(transcode_job::Column::Id.is_in(overflow))
                .exec(&self.db)
                .await?
                .rows_affected;
        }
        Ok(aged + capped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;

    fn payload(video_id: &str) -> TranscodeJobPayload {
        TranscodeJobPayload {
            video_id: video_id.to_string(),
            source_url: format!("s3://media/sources/{}/original.mp4", video_id),
        }
    }

    async fn queue(max_attempts: u32) -> (tempfile::TempDir, JobQueue) {
        let (dir, db) = temp_db().await;
        (dir, JobQueue::new(db, max_attempts, Duration::from_secs(5)))
    }

    #[test]
    fn payload_wire_format() {
        let encoded = serde_json::to_string(&payload("v1")).unwrap();
        assert_eq!(
            encoded,
            r#"{"videoId":"v1","sourceUrl":"s3://media/sources/v1/original.mp4"}"#
        );
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_video() {
        let (_dir, q) = queue(3).await;
        let first = q.enqueue_transcode(&q.db, &payload("v1"), 0).await.unwrap();
        let second = q.enqueue_transcode(&q.db, &payload("v1"), 0).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(q.pending_depth_for("v1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_fifo() {
        let (_dir, q) = queue(3).await;
        q.enqueue_transcode(&q.db, &payload("low-a"), 0).await.unwrap();
        q.enqueue_transcode(&q.db, &payload("low-b"), 0).await.unwrap();
        q.enqueue_transcode(&q.db, &payload("high"), 5).await.unwrap();

        let order: Vec<String> = [
            q.claim_next().await.unwrap().unwrap(),
            q.claim_next().await.unwrap().unwrap(),
            q.claim_next().await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|j| j.video_id)
        .collect();
        assert_eq!(order, vec!["high", "low-a", "low-b"]);
        assert!(q.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_backs_off_then_dead_letters() {
        let (_dir, q) = queue(2).await;
        q.enqueue_transcode(&q.db, &payload("v1"), 0).await.unwrap();

        let job = q.claim_next().await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);

        // First failure: requeued in the future, so not immediately claimable.
        let outcome = q.fail(&job.id, "codec exploded").await.unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { .. }));
        assert!(q.claim_next().await.unwrap().is_none());

        // Make it claimable now and burn the second attempt.
        transcode_job::Entity::update_many()
            .col_expr(transcode_job::Column::RunAt, Expr::value(Utc::now()))
            .filter(transcode_job::Column::Id.eq(job.id.as_str()))
            .exec(&q.db)
            .await
            .unwrap();
        let job = q.claim_next().await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);

        let outcome = q.fail(&job.id, "codec exploded again").await.unwrap();
        assert_eq!(outcome, FailOutcome::Dead);
        assert_eq!(q.pending_depth_for("v1").await.unwrap(), 0);
        assert_eq!(q.dead_jobs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ack_completes_job() {
        let (_dir, q) = queue(3).await;
        q.enqueue_transcode(&q.db, &payload("v1"), 0).await.unwrap();
        let job = q.claim_next().await.unwrap().unwrap();
        q.ack(&job.id).await.unwrap();

        let row = transcode_job::Entity::find_by_id(job.id)
            .one(&q.db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status(), JobStatus::Completed);
        assert!(row.finished_at.is_some());

        // A completed job no longer blocks re-enqueue for the same video.
        q.enqueue_transcode(&q.db, &payload("v1"), 0).await.unwrap();
        assert_eq!(q.pending_depth_for("v1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn prune_drops_aged_completed_jobs() {
        let (_dir, q) = queue(3).await;
        q.enqueue_transcode(&q.db, &payload("v1"), 0).await.unwrap();
        let job = q.claim_next().await.unwrap().unwrap();
        q.ack(&job.id).await.unwrap();

        // Age the row past the completed retention window.
        transcode_job::Entity::update_many()
            .col_expr(
                transcode_job::Column::FinishedAt,
                Expr::value(Some(Utc::now() - ChronoDuration::hours(25))),
            )
            .filter(transcode_job::Column::Id.eq(job.id.as_str()))
            .exec(&q.db)
            .await
            .unwrap();

        assert_eq!(q.prune().await.unwrap(), 1);
    }
}
