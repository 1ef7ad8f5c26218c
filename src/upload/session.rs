//! Upload session manager: the ingest protocol state machine.
//!
//! Owns UploadSession rows end to end. Chooses single-PUT vs multipart from
//! the declared size, mints and refreshes presigned URLs, keeps the per-part
//! checksum registry, validates completions, and aborts on cancel. Lifecycle
//! transitions ride on CAS updates so two replicas racing the same video
//! resolve to exactly one winner.

use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::{Set, TransactionTrait, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Config;
use crate::db::entities::upload_session::{self, PartRecord, SessionStatus};
use crate::db::entities::video::{self, VideoStatus};
use crate::error::{ApiError, Result};
use crate::metadata::{new_object_id, new_video, MetadataStore};
use crate::queue::{JobQueue, TranscodeJobPayload};
use crate::store::{keys, CompletedPart, ObjectStore, StoreError};

use super::checksum::{self, ChecksumFailure, RangeSpec};

/// How a declared size maps onto the upload protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPlan {
    Single,
    Multipart { part_size: u64, num_parts: u32 },
}

/// Pick single-PUT vs multipart for a declared size.
pub fn plan_session(size: u64, config: &Config) -> Result<SessionPlan> {
    if size <= config.multipart_threshold {
        return Ok(SessionPlan::Single);
    }
    let part_size = config.multipart_chunk_bytes;
    let num_parts = size.div_ceil(part_size);
    if num_parts > config.max_multipart_parts as u64 {
        return Err(ApiError::PartsLimit {
            requested: num_parts,
            max: config.max_multipart_parts,
        });
    }
    Ok(SessionPlan::Multipart {
        part_size,
        num_parts: num_parts as u32,
    })
}

/// Validated request to open an upload.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    /// Base64 SHA-256 over the whole source, bound into single-PUT URLs.
    pub checksum: Option<String>,
    pub title: Option<String>,
    pub is_public: bool,
}

/// Minted URL set returned from session creation.
#[derive(Debug, Clone)]
pub enum MintedSession {
    Single {
        upload_url: String,
        expires_at: chrono::DateTime<Utc>,
    },
    Multipart {
        multipart_upload_id: String,
        part_urls: Vec<String>,
        part_size: u64,
        num_parts: u32,
        expires_at: chrono::DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct CreatedUpload {
    pub video: video::Model,
    pub minted: MintedSession,
}

#[derive(Debug, Clone)]
pub struct RefreshedUrls {
    pub part_urls: Vec<String>,
    pub part_size: u64,
    pub expires_at: chrono::DateTime<Utc>,
}

/// One entry of a part-checksum registration.
#[derive(Debug, Clone)]
pub struct PartChecksum {
    pub part_number: u32,
    pub checksum: String,
    pub size: Option<u64>,
}

/// Client-supplied completion input.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub multipart_upload_id: Option<String>,
    pub parts: Vec<CompletedPart>,
}

pub struct UploadSessionManager {
    store: Arc<dyn ObjectStore>,
    meta: MetadataStore,
    queue: JobQueue,
    config: Arc<Config>,
}

impl UploadSessionManager {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        meta: MetadataStore,
        queue: JobQueue,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            meta,
            queue,
            config,
        }
    }

    fn source_key_of(video: &video::Model) -> Result<String> {
        keys::parse_source_url(&video.source_url)
            .map(|(_, key)| key.to_string())
            .ok_or_else(|| {
                ApiError::Validation(format!("malformed source url on video {}", video.id))
            })
    }

    async fn require_video(&self, video_id: &str) -> Result<video::Model> {
        self.meta
            .video(video_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("video {}", video_id)))
    }

    fn require_pending(video: &video::Model) -> Result<()> {
        match video.status() {
            VideoStatus::PendingUpload => Ok(()),
            current => Err(ApiError::StateConflict { current }),
        }
    }

    /// Create the video row and mint an upload session for it.
    pub async fn create(&self, req: NewUpload) -> Result<CreatedUpload> {
        if req.filename.trim().is_empty() {
            return Err(ApiError::Validation("filename must not be empty".into()));
        }
        if req.content_type.trim().is_empty() {
            return Err(ApiError::Validation("contentType must not be empty".into()));
        }
        if req.size == 0 {
            return Err(ApiError::Validation("size must be at least 1 byte".into()));
        }
        if req.size > self.config.max_file_size {
            return Err(ApiError::TooLarge {
                declared: req.size,
                max: self.config.max_file_size,
            });
        }
        if let Some(sum) = &req.checksum {
            if !checksum::is_valid_sha256_b64(sum) {
                return Err(ApiError::Validation(
                    "checksum must be base64-encoded SHA-256".into(),
                ));
            }
        }
        let title = req
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| req.filename.clone());
        if title.chars().count() > 512 {
            return Err(ApiError::Validation(
                "title must be at most 512 characters".into(),
            ));
        }

        let plan = plan_session(req.size, &self.config)?;
        let video_id = new_object_id();
        let key = keys::source_key(&video_id, keys::extension_of(&req.filename));
        let source_url = keys::source_url(&self.config.bucket, &key);
        let ttl = self.config.presign_ttl;
        let expires_at = Utc::now() + ChronoDuration::from_std(ttl).unwrap_or_default();

        match plan {
            SessionPlan::Single => {
                let upload_url = self
                    .store
                    .mint_single_put(&key, &req.content_type, ttl, req.checksum.as_deref())
                    .await?;

                let session_id = self
                    .config
                    .persist_single_part_sessions
                    .then(new_object_id);

                let video = self
                    .meta
                    .insert_video(new_video(
                        &video_id,
                        &title,
                        &source_url,
                        req.size,
                        req.checksum.clone(),
                        &req.content_type,
                        session_id.clone(),
                        req.is_public,
                    ))
                    .await?;

                if let Some(sid) = session_id {
                    self.insert_session(&sid, &video_id, None, 1, req.size, expires_at)
                        .await?;
                }

                tracing::info!(
                    "upload created: video={} mode=single size={}",
                    video_id,
                    req.size
                );
                Ok(CreatedUpload {
                    video,
                    minted: MintedSession::Single {
                        upload_url,
                        expires_at,
                    },
                })
            }
            SessionPlan::Multipart {
                part_size,
                num_parts,
            } => {
                let multipart_upload_id = self
                    .store
                    .initiate_multipart(&key, &req.content_type)
                    .await?;
                let part_urls = self
                    .mint_part_urls(&key, &multipart_upload_id, num_parts, ttl)
                    .await?;

                let session_id = new_object_id();
                let video = self
                    .meta
                    .insert_video(new_video(
                        &video_id,
                        &title,
                        &source_url,
                        req.size,
                        req.checksum.clone(),
                        &req.content_type,
                        Some(session_id.clone()),
                        req.is_public,
                    ))
                    .await?;
                self.insert_session(
                    &session_id,
                    &video_id,
                    Some(multipart_upload_id.clone()),
                    num_parts,
                    part_size,
                    expires_at,
                )
                .await?;

                tracing::info!(
                    "upload created: video={} mode=multipart parts={} part_size={}",
                    video_id,
                    num_parts,
                    part_size
                );
                Ok(CreatedUpload {
                    video,
                    minted: MintedSession::Multipart {
                        multipart_upload_id,
                        part_urls,
                        part_size,
                        num_parts,
                        expires_at,
                    },
                })
            }
        }
    }

    async fn insert_session(
        &self,
        id: &str,
        video_id: &str,
        multipart_upload_id: Option<String>,
        total_parts: u32,
        part_size: u64,
        expires_at: chrono::DateTime<Utc>,
    ) -> Result<upload_session::Model> {
        Ok(self
            .meta
            .insert_session(upload_session::ActiveModel {
                id: Set(id.to_string()),
                video_id: Set(video_id.to_string()),
                multipart_upload_id: Set(multipart_upload_id),
                total_parts: Set(total_parts as i32),
                part_size: Set(part_size as i64),
                uploaded_parts: Set("[]".to_string()),
                status: Set(SessionStatus::Active.as_str().to_string()),
                expires_at: Set(expires_at),
                created_at: Set(Utc::now()),
                completed_at: Set(None),
            })
            .await?)
    }

    async fn mint_part_urls(
        &self,
        key: &str,
        upload_id: &str,
        num_parts: u32,
        ttl: std::time::Duration,
    ) -> Result<Vec<String>> {
        let mut urls = Vec::with_capacity(num_parts as usize);
        for part_number in 1..=num_parts {
            urls.push(
                self.store
                    .mint_part_put(key, upload_id, part_number, ttl)
                    .await?,
            );
        }
        Ok(urls)
    }

    /// Re-mint every part URL with a fresh expiry. The multipart upload id
    /// and already-uploaded parts are untouched.
    pub async fn refresh_urls(&self, video_id: &str) -> Result<RefreshedUrls> {
        let video = self.require_video(video_id).await?;
        Self::require_pending(&video)?;

        let session = self
            .meta
            .session_for_video(video_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("upload session for video {}", video_id)))?;
        if session.status() != SessionStatus::Active {
            return Err(ApiError::Validation(format!(
                "session is {}, not active",
                session.status()
            )));
        }
        let multipart_upload_id = session.multipart_upload_id.as_deref().ok_or_else(|| {
            ApiError::Validation("single-part uploads have no part URLs to refresh".into())
        })?;

        let key = Self::source_key_of(&video)?;
        let ttl = self.config.presign_ttl;
        let part_urls = self
            .mint_part_urls(&key, multipart_upload_id, session.total_parts as u32, ttl)
            .await?;
        let expires_at = Utc::now() + ChronoDuration::from_std(ttl).unwrap_or_default();
        self.meta
            .refresh_session_expiry(&session.id, expires_at)
            .await?;

        Ok(RefreshedUrls {
            part_urls,
            part_size: session.part_size as u64,
            expires_at,
        })
    }

    /// Merge client-declared part checksums into the session registry.
    pub async fn register_checksums(
        &self,
        video_id: &str,
        entries: Vec<PartChecksum>,
    ) -> Result<usize> {
        if entries.is_empty() {
            return Err(ApiError::Validation("no part checksums supplied".into()));
        }
        let video = self.require_video(video_id).await?;
        Self::require_pending(&video)?;

        let session = self
            .meta
            .session_for_video(video_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("upload session for video {}", video_id)))?;
        if session.status() != SessionStatus::Active {
            return Err(ApiError::Validation(format!(
                "session is {}, not active",
                session.status()
            )));
        }

        let total_parts = session.total_parts as u32;
        let part_size = session.part_size as u64;
        let mut seen = std::collections::HashSet::new();
        for entry in &entries {
            if entry.part_number < 1 || entry.part_number > total_parts {
                return Err(ApiError::Validation(format!(
                    "partNumber {} out of range 1..={}",
                    entry.part_number, total_parts
                )));
            }
            if !seen.insert(entry.part_number) {
                return Err(ApiError::Validation(format!(
                    "duplicate partNumber {}",
                    entry.part_number
                )));
            }
            if !checksum::is_valid_sha256_b64(&entry.checksum) {
                return Err(ApiError::Validation(format!(
                    "part {} checksum must be base64-encoded SHA-256",
                    entry.part_number
                )));
            }
            if let Some(size) = entry.size {
                if size == 0 || size > part_size {
                    return Err(ApiError::Validation(format!(
                        "part {} size {} outside 1..={}",
                        entry.part_number, size, part_size
                    )));
                }
            }
        }

        let mut registry: BTreeMap<u32, PartRecord> = session
            .parts()
            .into_iter()
            .map(|p| (p.part_number, p))
            .collect();
        let accepted = entries.len();
        for entry in entries {
            let record = registry.entry(entry.part_number).or_insert(PartRecord {
                part_number: entry.part_number,
                etag: None,
                checksum: None,
                size: None,
            });
            record.checksum = Some(entry.checksum);
            record.size = entry.size;
        }
        let merged: Vec<PartRecord> = registry.into_values().collect();
        self.meta.update_session_parts(&session.id, &merged).await?;
        Ok(accepted)
    }

    /// Mark the video failed and close its session out of `active`.
    async fn fail_upload(
        &self,
        video_id: &str,
        session: Option<&upload_session::Model>,
        to: SessionStatus,
        error: &str,
    ) -> Result<()> {
        self.meta
            .fail_video(video_id, VideoStatus::PendingUpload, error)
            .await?;
        if let Some(s) = session {
            self.meta.close_session(self.meta.conn(), &s.id, to).await?;
        }
        Ok(())
    }

    /// Finalize an upload: provider completion, integrity validation, and the
    /// transactional `pending_upload -> processing` advance with job enqueue.
    pub async fn complete(
        &self,
        video_id: &str,
        req: CompletionRequest,
    ) -> Result<video::Model> {
        let video = self.require_video(video_id).await?;
        Self::require_pending(&video)?;
        let session = self.meta.session_for_video(video_id).await?;
        let key = Self::source_key_of(&video)?;

        if let Some(s) = &session {
            if s.is_expired() {
                if let Some(mp) = s.multipart_upload_id.as_deref() {
                    // Best effort; the collector sweeps whatever survives.
                    if let Err(e) = self.store.abort_multipart(&key, mp).await {
                        tracing::warn!("abort of expired upload {} failed: {}", mp, e);
                    }
                }
                self.fail_upload(video_id, session.as_ref(), SessionStatus::Expired, "upload expired")
                    .await?;
                return Err(ApiError::UploadExpired);
            }
        }

        let multipart = session
            .as_ref()
            .and_then(|s| s.multipart_upload_id.clone().map(|mp| (s, mp)));

        match multipart {
            Some((s, mp_id)) => {
                self.complete_multipart(&video, s, &mp_id, &key, req)
                    .await?
            }
            None => self.complete_single(&video, session.as_ref(), &key, req).await?,
        }

        self.advance_to_processing(&video, session.as_ref()).await
    }

    async fn complete_multipart(
        &self,
        video: &video::Model,
        session: &upload_session::Model,
        multipart_upload_id: &str,
        key: &str,
        req: CompletionRequest,
    ) -> Result<()> {
        if let Some(claimed) = &req.multipart_upload_id {
            if claimed != multipart_upload_id {
                return Err(ApiError::Validation(
                    "multipartUploadId does not match this session".into(),
                ));
            }
        }

        let total_parts = session.total_parts as usize;
        if req.parts.len() != total_parts {
            return Err(ApiError::Validation(format!(
                "expected {} parts, got {}",
                total_parts,
                req.parts.len()
            )));
        }
        for (i, part) in req.parts.iter().enumerate() {
            let expected = (i + 1) as u32;
            if part.part_number != expected {
                return Err(ApiError::Validation(format!(
                    "parts must be ordered 1..{}; position {} holds part {}",
                    total_parts,
                    i + 1,
                    part.part_number
                )));
            }
            if part.etag.trim().is_empty() {
                return Err(ApiError::Validation(format!(
                    "part {} has an empty etag",
                    part.part_number
                )));
            }
        }

        if let Err(e) = self
            .store
            .complete_multipart(key, multipart_upload_id, &req.parts)
            .await
        {
            self.fail_upload(
                &video.id,
                Some(session),
                SessionStatus::Failed,
                &format!("multipart completion failed: {}", e),
            )
            .await?;
            return Err(ApiError::Store(e));
        }

        self.verify_consolidated_object(video, Some(session), key)
            .await?;

        let registered = session.registered_checksums();
        if !registered.is_empty() {
            let part_size = session.part_size as u64;
            let num_parts = session.total_parts as u32;
            let declared = video.source_size as u64;
            let specs: Vec<RangeSpec> = registered
                .iter()
                .map(|p| {
                    let offset = (p.part_number as u64 - 1) * part_size;
                    let default_len = if p.part_number == num_parts {
                        declared - part_size * (num_parts as u64 - 1)
                    } else {
                        part_size
                    };
                    RangeSpec {
                        part_number: p.part_number,
                        offset,
                        len: p.size.unwrap_or(default_len),
                        expected: p.checksum.clone().unwrap_or_default(),
                    }
                })
                .collect();

            let outcome = checksum::verify_ranges(
                self.store.as_ref(),
                key,
                &specs,
                self.config.validation_parallelism,
                self.config.max_validation_wall,
            )
            .await;
            self.handle_checksum_outcome(&video.id, Some(session), outcome)
                .await?;
        }
        Ok(())
    }

    async fn complete_single(
        &self,
        video: &video::Model,
        session: Option<&upload_session::Model>,
        key: &str,
        req: CompletionRequest,
    ) -> Result<()> {
        if !req.parts.is_empty() || req.multipart_upload_id.is_some() {
            return Err(ApiError::Validation(
                "single-part completion takes no part list".into(),
            ));
        }

        self.verify_consolidated_object(video, session, key).await?;

        if let Some(expected) = &video.source_checksum {
            let outcome = checksum::verify_whole(
                self.store.as_ref(),
                key,
                video.source_size as u64,
                expected,
                self.config.max_validation_wall,
            )
            .await;
            self.handle_checksum_outcome(&video.id, session, outcome)
                .await?;
        }
        Ok(())
    }

    /// HEAD the uploaded object and require an exact size match.
    async fn verify_consolidated_object(
        &self,
        video: &video::Model,
        session: Option<&upload_session::Model>,
        key: &str,
    ) -> Result<()> {
        let head = match self.store.head(key).await {
            Ok(head) => head,
            Err(StoreError::NotFound(_)) => {
                let msg = "source object not found in store";
                self.fail_upload(&video.id, session, SessionStatus::Failed, msg)
                    .await?;
                return Err(ApiError::Validation(msg.into()));
            }
            Err(e) => return Err(ApiError::Store(e)),
        };
        if head.size != video.source_size as u64 {
            let msg = format!(
                "uploaded size {} does not match declared size {}",
                head.size, video.source_size
            );
            self.fail_upload(&video.id, session, SessionStatus::Failed, &msg)
                .await?;
            return Err(ApiError::Validation(msg));
        }
        Ok(())
    }

    async fn handle_checksum_outcome(
        &self,
        video_id: &str,
        session: Option<&upload_session::Model>,
        outcome: std::result::Result<(), ChecksumFailure>,
    ) -> Result<()> {
        match outcome {
            Ok(()) => Ok(()),
            Err(ChecksumFailure::Mismatch {
                part_number,
                expected_prefix,
                actual_prefix,
            }) => {
                // The object is retained for forensic diagnosis.
                self.fail_upload(
                    video_id,
                    session,
                    SessionStatus::Failed,
                    &format!("checksum mismatch on part {}", part_number),
                )
                .await?;
                Err(ApiError::ChecksumMismatch {
                    part_number,
                    expected_prefix,
                    actual_prefix,
                })
            }
            Err(ChecksumFailure::TimedOut) => {
                let msg = format!(
                    "checksum validation exceeded {} s",
                    self.config.max_validation_wall.as_secs()
                );
                self.fail_upload(video_id, session, SessionStatus::Failed, &msg)
                    .await?;
                Err(ApiError::Validation(msg))
            }
            Err(ChecksumFailure::Store(e)) => {
                self.fail_upload(
                    video_id,
                    session,
                    SessionStatus::Failed,
                    &format!("checksum validation failed: {}", e),
                )
                .await?;
                Err(ApiError::Store(e))
            }
        }
    }

    /// The durable act: status CAS and job enqueue commit or roll back
    /// together, so a lost enqueue can never strand a video in `processing`.
    async fn advance_to_processing(
        &self,
        video: &video::Model,
        session: Option<&upload_session::Model>,
    ) -> Result<video::Model> {
        let txn = self.meta.conn().begin().await?;

        let advanced = self
            .meta
            .advance_video_status(
                &txn,
                &video.id,
                VideoStatus::PendingUpload,
                VideoStatus::Processing,
                vec![
                    (video::Column::ProcessingAttempts, Value::from(0i32)),
                    (video::Column::LastError, Value::from(Option::<String>::None)),
                ],
            )
            .await?;
        if !advanced {
            txn.rollback().await?;
            let current = self
                .meta
                .video(&video.id)
                .await?
                .map(|v| v.status())
                .unwrap_or(VideoStatus::Failed);
            return Err(ApiError::StateConflict { current });
        }

        let payload = TranscodeJobPayload {
            video_id: video.id.clone(),
            source_url: video.source_url.clone(),
        };
        self.queue
            .enqueue_transcode(&txn, &payload, 0)
            .await
            .map_err(|e| ApiError::Queue(e.to_string()))?;

        if let Some(s) = session {
            self.meta
                .close_session(&txn, &s.id, SessionStatus::Completed)
                .await?;
        }
        txn.commit().await?;

        tracing::info!("upload completed: video={} -> processing", video.id);
        self.require_video(&video.id).await
    }

    /// Client-initiated cancel: abort the multipart upload, drop the source
    /// object, and move the video to `cancelled`. Idempotent on repeat.
    pub async fn abort(&self, video_id: &str) -> Result<()> {
        let video = self.require_video(video_id).await?;
        match video.status() {
            VideoStatus::PendingUpload | VideoStatus::Uploading => {}
            VideoStatus::Cancelled => return Ok(()),
            current => return Err(ApiError::StateConflict { current }),
        }

        let key = Self::source_key_of(&video)?;
        let session = self.meta.session_for_video(video_id).await?;
        if let Some(mp) = session
            .as_ref()
            .and_then(|s| s.multipart_upload_id.as_deref())
        {
            self.store.abort_multipart(&key, mp).await?;
        }
        // A finalized source gets deleted on cancel too.
        self.store.delete(&key).await?;

        let from = video.status();
        let advanced = self
            .meta
            .advance_video_status(
                self.meta.conn(),
                &video.id,
                from,
                VideoStatus::Cancelled,
                vec![(video::Column::CancelledAt, Value::from(Some(Utc::now())))],
            )
            .await?;
        if !advanced {
            let current = self
                .meta
                .video(video_id)
                .await?
                .map(|v| v.status())
                .unwrap_or(VideoStatus::Failed);
            if current == VideoStatus::Cancelled {
                return Ok(());
            }
            return Err(ApiError::StateConflict { current });
        }
        if let Some(s) = &session {
            self.meta
                .close_session(self.meta.conn(), &s.id, SessionStatus::Failed)
                .await?;
        }
        tracing::info!("upload aborted: video={} -> cancelled", video_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_PART_BYTES;
    use crate::db::test_support::temp_db;
    use crate::store::MemoryStore;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use bytes::Bytes;
    use sha2::{Digest, Sha256};
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            bucket: "media".into(),
            multipart_threshold: 1024,
            multipart_chunk_bytes: MIN_PART_BYTES,
            max_file_size: 64 * 1024 * 1024,
            ..Config::default()
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        mgr: UploadSessionManager,
        meta: MetadataStore,
        queue: JobQueue,
    }

    async fn harness() -> Harness {
        let config = test_config();
        let (dir, db) = temp_db().await;
        let meta = MetadataStore::new(db.clone());
        let queue = JobQueue::new(db, 3, Duration::from_secs(5));
        let store = Arc::new(MemoryStore::new());
        let mgr = UploadSessionManager::new(
            store.clone(),
            meta.clone(),
            queue.clone(),
            Arc::new(config),
        );
        Harness {
            _dir: dir,
            store,
            mgr,
            meta,
            queue,
        }
    }

    fn checksum_of(data: &[u8]) -> String {
        BASE64.encode(Sha256::digest(data))
    }

    fn upload_request(size: u64, checksum: Option<String>) -> NewUpload {
        NewUpload {
            filename: "clip.mp4".into(),
            content_type: "video/mp4".into(),
            size,
            checksum,
            title: None,
            is_public: false,
        }
    }

    fn source_key(video: &video::Model) -> String {
        keys::parse_source_url(&video.source_url).unwrap().1.to_string()
    }

    /// Two-part multipart upload: a full 5 MiB part plus a short tail.
    fn two_part_body() -> (Vec<u8>, Vec<u8>) {
        (vec![7u8; MIN_PART_BYTES as usize], vec![9u8; 100])
    }

    #[tokio::test]
    async fn session_selection_boundary() {
        let h = harness().await;

        let at_threshold = h.mgr.create(upload_request(1024, None)).await.unwrap();
        assert!(matches!(at_threshold.minted, MintedSession::Single { .. }));

        let over = h.mgr.create(upload_request(1025, None)).await.unwrap();
        match over.minted {
            MintedSession::Multipart { num_parts, .. } => assert_eq!(num_parts, 1),
            other => panic!("expected multipart, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn declared_size_is_capped() {
        let h = harness().await;
        let max = test_config().max_file_size;
        assert!(h.mgr.create(upload_request(max, None)).await.is_ok());
        let err = h.mgr.create(upload_request(max + 1, None)).await.unwrap_err();
        assert!(matches!(err, ApiError::TooLarge { .. }));
    }

    #[test]
    fn parts_limit_is_enforced() {
        let config = Config {
            multipart_threshold: 1024,
            multipart_chunk_bytes: MIN_PART_BYTES,
            max_multipart_parts: 2,
            ..Config::default()
        };
        assert!(matches!(
            plan_session(3 * MIN_PART_BYTES, &config),
            Err(ApiError::PartsLimit {
                requested: 3,
                max: 2
            })
        ));
        assert!(matches!(
            plan_session(2 * MIN_PART_BYTES, &config),
            Ok(SessionPlan::Multipart { num_parts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn single_put_happy_path() {
        let h = harness().await;
        let body = b"tiny but legitimate video bytes".to_vec();
        let created = h
            .mgr
            .create(upload_request(body.len() as u64, Some(checksum_of(&body))))
            .await
            .unwrap();
        let key = source_key(&created.video);

        // Client PUTs the exact bytes against the minted URL.
        h.store.put_object(&key, Bytes::from(body)).unwrap();

        let completed = h
            .mgr
            .complete(&created.video.id, CompletionRequest::default())
            .await
            .unwrap();
        assert_eq!(completed.status(), VideoStatus::Processing);
        assert_eq!(completed.processing_attempts, 0);
        assert_eq!(h.queue.pending_depth_for(&created.video.id).await.unwrap(), 1);

        // Single-PUT sessions are persisted by default with total_parts = 1.
        let session = h.meta.session_for_video(&created.video.id).await.unwrap().unwrap();
        assert_eq!(session.total_parts, 1);
        assert_eq!(session.status(), SessionStatus::Completed);
    }

    #[tokio::test]
    async fn multipart_with_checksums_completes() {
        let h = harness().await;
        let (part1, part2) = two_part_body();
        let total = (part1.len() + part2.len()) as u64;

        let created = h.mgr.create(upload_request(total, None)).await.unwrap();
        let (mp_id, num_parts) = match &created.minted {
            MintedSession::Multipart {
                multipart_upload_id,
                num_parts,
                part_urls,
                ..
            } => {
                assert_eq!(part_urls.len(), *num_parts as usize);
                (multipart_upload_id.clone(), *num_parts)
            }
            other => panic!("expected multipart, got {:?}", other),
        };
        assert_eq!(num_parts, 2);

        let accepted = h
            .mgr
            .register_checksums(
                &created.video.id,
                vec![
                    PartChecksum {
                        part_number: 1,
                        checksum: checksum_of(&part1),
                        size: Some(part1.len() as u64),
                    },
                    PartChecksum {
                        part_number: 2,
                        checksum: checksum_of(&part2),
                        size: Some(part2.len() as u64),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(accepted, 2);

        let e1 = h.store.upload_part(&mp_id, 1, Bytes::from(part1)).unwrap();
        let e2 = h.store.upload_part(&mp_id, 2, Bytes::from(part2)).unwrap();

        let completed = h
            .mgr
            .complete(
                &created.video.id,
                CompletionRequest {
                    multipart_upload_id: Some(mp_id),
                    parts: vec![
                        CompletedPart {
                            part_number: 1,
                            etag: e1,
                        },
                        CompletedPart {
                            part_number: 2,
                            etag: e2,
                        },
                    ],
                },
            )
            .await
            .unwrap();
        assert_eq!(completed.status(), VideoStatus::Processing);
        assert_eq!(h.queue.pending_depth_for(&created.video.id).await.unwrap(), 1);
        assert!(h.store.object_exists(&source_key(&completed)));
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_video_and_retains_object() {
        let h = harness().await;
        let (part1, part2) = two_part_body();
        let total = (part1.len() + part2.len()) as u64;

        let created = h.mgr.create(upload_request(total, None)).await.unwrap();
        let mp_id = match &created.minted {
            MintedSession::Multipart {
                multipart_upload_id, ..
            } => multipart_upload_id.clone(),
            _ => unreachable!(),
        };

        h.mgr
            .register_checksums(
                &created.video.id,
                vec![
                    PartChecksum {
                        part_number: 1,
                        checksum: checksum_of(&part1),
                        size: Some(part1.len() as u64),
                    },
                    PartChecksum {
                        part_number: 2,
                        // Declared for different bytes than will be uploaded.
                        checksum: checksum_of(b"not what gets uploaded"),
                        size: Some(part2.len() as u64),
                    },
                ],
            )
            .await
            .unwrap();

        let e1 = h.store.upload_part(&mp_id, 1, Bytes::from(part1)).unwrap();
        let e2 = h.store.upload_part(&mp_id, 2, Bytes::from(part2)).unwrap();

        let err = h
            .mgr
            .complete(
                &created.video.id,
                CompletionRequest {
                    multipart_upload_id: Some(mp_id),
                    parts: vec![
                        CompletedPart {
                            part_number: 1,
                            etag: e1,
                        },
                        CompletedPart {
                            part_number: 2,
                            etag: e2,
                        },
                    ],
                },
            )
            .await
            .unwrap_err();
        match err {
            ApiError::ChecksumMismatch { part_number, .. } => assert_eq!(part_number, 2),
            other => panic!("expected checksum mismatch, got {:?}", other.to_string()),
        }

        let video = h.meta.video(&created.video.id).await.unwrap().unwrap();
        assert_eq!(video.status(), VideoStatus::Failed);
        // No job enqueued; source retained for diagnosis.
        assert_eq!(h.queue.pending_depth_for(&created.video.id).await.unwrap(), 0);
        assert!(h.store.object_exists(&source_key(&video)));
    }

    #[tokio::test]
    async fn double_complete_is_a_state_conflict() {
        let h = harness().await;
        let body = b"double complete body".to_vec();
        let created = h
            .mgr
            .create(upload_request(body.len() as u64, None))
            .await
            .unwrap();
        h.store
            .put_object(&source_key(&created.video), Bytes::from(body))
            .unwrap();

        h.mgr
            .complete(&created.video.id, CompletionRequest::default())
            .await
            .unwrap();
        let err = h
            .mgr
            .complete(&created.video.id, CompletionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::StateConflict {
                current: VideoStatus::Processing
            }
        ));
        // Exactly one enqueue survived both calls.
        assert_eq!(h.queue.pending_depth_for(&created.video.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn refresh_preserves_upload_id_and_parts() {
        let h = harness().await;
        let (part1, part2) = two_part_body();
        let total = (part1.len() + part2.len()) as u64;
        let created = h.mgr.create(upload_request(total, None)).await.unwrap();
        let mp_id = match &created.minted {
            MintedSession::Multipart {
                multipart_upload_id, ..
            } => multipart_upload_id.clone(),
            _ => unreachable!(),
        };

        h.mgr
            .register_checksums(
                &created.video.id,
                vec![PartChecksum {
                    part_number: 1,
                    checksum: checksum_of(&part1),
                    size: Some(part1.len() as u64),
                }],
            )
            .await
            .unwrap();
        h.store.upload_part(&mp_id, 1, Bytes::from(part1)).unwrap();

        let refreshed = h.mgr.refresh_urls(&created.video.id).await.unwrap();
        assert_eq!(refreshed.part_urls.len(), 2);
        assert_eq!(refreshed.part_size, MIN_PART_BYTES);

        let session = h.meta.session_for_video(&created.video.id).await.unwrap().unwrap();
        assert_eq!(session.multipart_upload_id.as_deref(), Some(mp_id.as_str()));
        assert_eq!(session.registered_checksums().len(), 1);
        assert!(h.store.multipart_exists(&mp_id));
    }

    #[tokio::test]
    async fn abort_cleans_store_and_cancels() {
        let h = harness().await;
        let (part1, part2) = two_part_body();
        let total = (part1.len() + part2.len()) as u64;
        let created = h.mgr.create(upload_request(total, None)).await.unwrap();
        let mp_id = match &created.minted {
            MintedSession::Multipart {
                multipart_upload_id, ..
            } => multipart_upload_id.clone(),
            _ => unreachable!(),
        };
        h.store.upload_part(&mp_id, 1, Bytes::from(part1)).unwrap();

        h.mgr.abort(&created.video.id).await.unwrap();

        let video = h.meta.video(&created.video.id).await.unwrap().unwrap();
        assert_eq!(video.status(), VideoStatus::Cancelled);
        assert!(video.cancelled_at.is_some());
        assert!(!h.store.multipart_exists(&mp_id));
        assert!(!h.store.object_exists(&source_key(&video)));

        // Repeat abort is a no-op success.
        h.mgr.abort(&created.video.id).await.unwrap();

        // Completing a cancelled upload is a conflict.
        let err = h.mgr.complete(&created.video.id, CompletionRequest::default()).await;
        assert!(matches!(err, Err(ApiError::StateConflict { .. })));
    }

    #[tokio::test]
    async fn expired_session_fails_completion() {
        let h = harness().await;
        let (part1, part2) = two_part_body();
        let total = (part1.len() + part2.len()) as u64;
        let created = h.mgr.create(upload_request(total, None)).await.unwrap();

        let session = h.meta.session_for_video(&created.video.id).await.unwrap().unwrap();
        h.meta
            .refresh_session_expiry(&session.id, Utc::now() - ChronoDuration::hours(2))
            .await
            .unwrap();

        let err = h
            .mgr
            .complete(&created.video.id, CompletionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::UploadExpired));

        let video = h.meta.video(&created.video.id).await.unwrap().unwrap();
        assert_eq!(video.status(), VideoStatus::Failed);
        assert_eq!(video.last_error.as_deref(), Some("upload expired"));
        let session = h.meta.session(&session.id).await.unwrap().unwrap();
        assert_eq!(session.status(), SessionStatus::Expired);
    }

    #[tokio::test]
    async fn incomplete_part_list_is_rejected() {
        let h = harness().await;
        let (part1, part2) = two_part_body();
        let total = (part1.len() + part2.len()) as u64;
        let created = h.mgr.create(upload_request(total, None)).await.unwrap();
        let mp_id = match &created.minted {
            MintedSession::Multipart {
                multipart_upload_id, ..
            } => multipart_upload_id.clone(),
            _ => unreachable!(),
        };
        let e1 = h.store.upload_part(&mp_id, 1, Bytes::from(part1)).unwrap();

        let err = h
            .mgr
            .complete(
                &created.video.id,
                CompletionRequest {
                    multipart_upload_id: Some(mp_id),
                    parts: vec![CompletedPart {
                        part_number: 1,
                        etag: e1,
                    }],
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));

        // Validation rejections leave the video pending for a retry.
        let video = h.meta.video(&created.video.id).await.unwrap().unwrap();
        assert_eq!(video.status(), VideoStatus::PendingUpload);
    }

    #[tokio::test]
    async fn size_mismatch_fails_the_video() {
        let h = harness().await;
        let created = h.mgr.create(upload_request(1000, None)).await.unwrap();
        h.store
            .put_object(&source_key(&created.video), Bytes::from(vec![0u8; 999]))
            .unwrap();

        let err = h
            .mgr
            .complete(&created.video.id, CompletionRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        let video = h.meta.video(&created.video.id).await.unwrap().unwrap();
        assert_eq!(video.status(), VideoStatus::Failed);
    }
}
