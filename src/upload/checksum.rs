//! Completion-time integrity validation.
//!
//! Registered part checksums are verified by reading each part's byte range
//! back from the consolidated object and hashing it. Reads run with bounded
//! parallelism and a wall-clock budget; a single mismatch fails the whole
//! validation.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::{self, TryStreamExt};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::store::{ObjectStore, StoreError};

/// Window size for ranged reads while hashing a part.
const RANGE_READ_BYTES: u64 = 8 * 1024 * 1024;

/// One byte range to verify against a declared checksum.
#[derive(Debug, Clone)]
pub struct RangeSpec {
    pub part_number: u32,
    pub offset: u64,
    pub len: u64,
    /// Base64 SHA-256 the client declared for these bytes.
    pub expected: String,
}

#[derive(Debug)]
pub enum ChecksumFailure {
    Mismatch {
        part_number: u32,
        expected_prefix: String,
        actual_prefix: String,
    },
    Store(StoreError),
    TimedOut,
}

/// Decode-and-shape check for a declared checksum: base64 of 32 bytes.
pub fn is_valid_sha256_b64(value: &str) -> bool {
    BASE64
        .decode(value)
        .map(|raw| raw.len() == 32)
        .unwrap_or(false)
}

fn prefix(s: &str) -> String {
    s.chars().take(12).collect()
}

async fn hash_range(
    store: &dyn ObjectStore,
    key: &str,
    offset: u64,
    len: u64,
) -> Result<String, StoreError> {
    let mut hasher = Sha256::new();
    let mut cursor = offset;
    let end = offset + len; // exclusive
    while cursor < end {
        let window_end = (cursor + RANGE_READ_BYTES).min(end);
        let chunk = store.range_get(key, cursor, window_end - 1).await?;
        hasher.update(&chunk);
        cursor = window_end;
    }
    Ok(BASE64.encode(hasher.finalize()))
}

async fn verify_one(
    store: &dyn ObjectStore,
    key: &str,
    spec: &RangeSpec,
) -> Result<(), ChecksumFailure> {
    let actual = hash_range(store, key, spec.offset, spec.len)
        .await
        .map_err(ChecksumFailure::Store)?;
    if actual != spec.expected {
        return Err(ChecksumFailure::Mismatch {
            part_number: spec.part_number,
            expected_prefix: prefix(&spec.expected),
            actual_prefix: prefix(&actual),
        });
    }
    Ok(())
}

/// Verify every range with at most `parallelism` concurrent reads, bounded by
/// `wall`. Aborts outstanding reads on the first failure.
pub async fn verify_ranges(
    store: &dyn ObjectStore,
    key: &str,
    specs: &[RangeSpec],
    parallelism: usize,
    wall: Duration,
) -> Result<(), ChecksumFailure> {
    if specs.is_empty() {
        return Ok(());
    }
    let work = stream::iter(specs.iter().map(Ok))
        .try_for_each_concurrent(parallelism.max(1), |spec| verify_one(store, key, spec));

    match tokio::time::timeout(wall, work).await {
        Ok(result) => result,
        Err(_) => Err(ChecksumFailure::TimedOut),
    }
}

/// Whole-object verification for single-PUT uploads.
pub async fn verify_whole(
    store: &dyn ObjectStore,
    key: &str,
    size: u64,
    expected: &str,
    wall: Duration,
) -> Result<(), ChecksumFailure> {
    let spec = RangeSpec {
        part_number: 1,
        offset: 0,
        len: size,
        expected: expected.to_string(),
    };
    verify_ranges(store, key, std::slice::from_ref(&spec), 1, wall).await
}
