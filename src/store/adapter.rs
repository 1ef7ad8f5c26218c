//! Object-store adapter trait and error taxonomy.
//!
//! Uniform contract over an S3-compatible service: presigned URL minting,
//! multipart lifecycle, HEAD/DELETE, ranged reads, and listing of incomplete
//! multipart uploads. Providers differ wildly in error shape; everything is
//! folded into the small [`StoreError`] taxonomy at this boundary.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Storage error taxonomy. `Throttled` and `Transient` are retriable.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("throttled by provider: {0}")]
    Throttled(String),
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Throttled(_) | StoreError::Transient(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// HEAD response.
#[derive(Debug, Clone)]
pub struct HeadObject {
    pub size: u64,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One finished part, as the client reports it at completion time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// An in-flight multipart upload surfaced by the provider listing.
#[derive(Debug, Clone)]
pub struct IncompleteUpload {
    pub key: String,
    pub upload_id: String,
    pub initiated_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Mint a presigned PUT URL for a whole object. When `checksum_sha256`
    /// (base64) is given it is bound into the signature, so the provider
    /// rejects bodies that don't hash to it.
    async fn mint_single_put(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
        checksum_sha256: Option<&str>,
    ) -> StoreResult<String>;

    async fn initiate_multipart(&self, key: &str, content_type: &str) -> StoreResult<String>;

    /// Mint a presigned PUT URL authorizing exactly one part.
    async fn mint_part_put(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> StoreResult<String>;

    /// Finalize a multipart upload. `parts` must be sorted ascending by part
    /// number and cover 1..N contiguously; violations are
    /// `PreconditionFailed` without a provider round trip.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<()>;

    /// Idempotent: succeeds when the upload was already aborted or completed.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StoreResult<()>;

    async fn head(&self, key: &str) -> StoreResult<HeadObject>;

    /// Idempotent delete.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Inclusive byte range read; errors on out-of-bounds ranges.
    async fn range_get(&self, key: &str, start: u64, end_inclusive: u64) -> StoreResult<Bytes>;

    async fn list_incomplete_multipart(
        &self,
        prefix: Option<&str>,
    ) -> StoreResult<Vec<IncompleteUpload>>;
}

/// Check the 1..N ascending-contiguous invariant on a completion part list.
pub fn validate_part_list(parts: &[CompletedPart]) -> StoreResult<()> {
    if parts.is_empty() {
        return Err(StoreError::PreconditionFailed(
            "multipart completion requires at least one part".to_string(),
        ));
    }
    for (i, part) in parts.iter().enumerate() {
        let expected = (i + 1) as u32;
        if part.part_number != expected {
            return Err(StoreError::PreconditionFailed(format!(
                "parts must cover 1..{} contiguously; position {} holds part {}",
                parts.len(),
                i + 1,
                part.part_number
            )));
        }
        if part.etag.is_empty() {
            return Err(StoreError::PreconditionFailed(format!(
                "part {} has an empty etag",
                part.part_number
            )));
        }
    }
    Ok(())
}

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 50;

/// Run `op`, retrying `Throttled`/`Transient` failures up to 3 times with
/// 50 ms * 2^n plus jitter. Other errors surface immediately.
pub async fn with_retries<T, F, Fut>(op: F) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retriable() && attempt < RETRY_ATTEMPTS => {
                let base = RETRY_BASE_MS << attempt;
                let jitter = rand::random::<u64>() % (RETRY_BASE_MS / 2 + 1);
                tracing::debug!(
                    "retriable storage error (attempt {}): {}; backing off {} ms",
                    attempt + 1,
                    e,
                    base + jitter
                );
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
