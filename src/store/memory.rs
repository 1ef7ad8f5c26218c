//! In-memory object store.
//!
//! Development fallback and test double for the S3 adapter. Implements real
//! multipart semantics (etags, part-size floor, idempotent abort) so the
//! orchestration layers can be exercised without a provider. Presigned URLs
//! are opaque `mem://` tokens; test clients deliver bytes through
//! [`MemoryStore::put_object`] and [`MemoryStore::upload_part`] instead of
//! HTTP PUTs.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::MIN_PART_BYTES;

use super::adapter::{
    validate_part_list, CompletedPart, HeadObject, IncompleteUpload, ObjectStore, StoreError,
    StoreResult,
};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
}

#[derive(Debug, Clone)]
struct StoredPart {
    data: Bytes,
    etag: String,
}

#[derive(Debug)]
struct MultipartState {
    key: String,
    parts: BTreeMap<u32, StoredPart>,
    initiated_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryStore {
    objects: DashMap<String, StoredObject>,
    multiparts: DashMap<String, MultipartState>,
    /// Checksums bound into minted single-PUT URLs, enforced on put_object.
    bound_checksums: DashMap<String, String>,
}

fn etag_of(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let hex: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
    format!("\"{}\"", hex)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the client's PUT against a minted single-object URL. Enforces
    /// a checksum bound at mint time, like the provider would.
    pub fn put_object(&self, key: &str, data: Bytes) -> StoreResult<()> {
        if let Some(expected) = self.bound_checksums.get(key) {
            let actual = BASE64.encode(Sha256::digest(&data));
            if actual != *expected {
                return Err(StoreError::PreconditionFailed(format!(
                    "checksum mismatch on PUT to {}",
                    key
                )));
            }
        }
        let etag = etag_of(&data);
        self.objects
            .insert(key.to_string(), StoredObject { data, etag });
        Ok(())
    }

    /// Simulate the client's PUT of one part; returns the provider etag.
    pub fn upload_part(&self, upload_id: &str, part_number: u32, data: Bytes) -> StoreResult<String> {
        let mut state = self
            .multiparts
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::NotFound(format!("upload {}", upload_id)))?;
        let etag = etag_of(&data);
        state
            .parts
            .insert(part_number, StoredPart { data, etag: etag.clone() });
        Ok(etag)
    }

    /// Backdate a multipart upload so collector tests can cross the TTL.
    pub fn set_initiated_at(&self, upload_id: &str, at: DateTime<Utc>) {
        if let Some(mut state) = self.multiparts.get_mut(upload_id) {
            state.initiated_at = at;
        }
    }

    pub fn object_exists(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn multipart_exists(&self, upload_id: &str) -> bool {
        self.multiparts.contains_key(upload_id)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn mint_single_put(
        &self,
        key: &str,
        _content_type: &str,
        ttl: Duration,
        checksum_sha256: Option<&str>,
    ) -> StoreResult<String> {
        if let Some(sum) = checksum_sha256 {
            self.bound_checksums
                .insert(key.to_string(), sum.to_string());
        }
        Ok(format!("mem://put/{}?expires={}", key, ttl.as_secs()))
    }

    async fn initiate_multipart(&self, key: &str, _content_type: &str) -> StoreResult<String> {
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        self.multiparts.insert(
            upload_id.clone(),
            MultipartState {
                key: key.to_string(),
                parts: BTreeMap::new(),
                initiated_at: Utc::now(),
            },
        );
        Ok(upload_id)
    }

    async fn mint_part_put(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> StoreResult<String> {
        if !self.multiparts.contains_key(upload_id) {
            return Err(StoreError::NotFound(format!("upload {}", upload_id)));
        }
        Ok(format!(
            "mem://put/{}?uploadId={}&partNumber={}&expires={}",
            key,
            upload_id,
            part_number,
            ttl.as_secs()
        ))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<()> {
        validate_part_list(parts)?;

        // A failed completion must leave the upload intact, so assemble
        // before removing any state.
        let assembled = {
            let state = self
                .multiparts
                .get(upload_id)
                .ok_or_else(|| StoreError::NotFound(format!("upload {}", upload_id)))?;

            if state.key != key {
                return Err(StoreError::PreconditionFailed(format!(
                    "upload {} does not belong to {}",
                    upload_id, key
                )));
            }

            let mut assembled = Vec::new();
            for (i, listed) in parts.iter().enumerate() {
                let stored = state.parts.get(&listed.part_number).ok_or_else(|| {
                    StoreError::PreconditionFailed(format!(
                        "InvalidPart: part {} was never uploaded",
                        listed.part_number
                    ))
                })?;
                if stored.etag != listed.etag {
                    return Err(StoreError::PreconditionFailed(format!(
                        "InvalidPart: etag mismatch on part {}",
                        listed.part_number
                    )));
                }
                let is_last = i == parts.len() - 1;
                if !is_last && (stored.data.len() as u64) < MIN_PART_BYTES {
                    return Err(StoreError::PreconditionFailed(format!(
                        "EntityTooSmall: part {} is {} bytes",
                        listed.part_number,
                        stored.data.len()
                    )));
                }
                assembled.extend_from_slice(&stored.data);
            }
            assembled
        };

        self.multiparts.remove(upload_id);
        let data = Bytes::from(assembled);
        let etag = etag_of(&data);
        self.objects
            .insert(key.to_string(), StoredObject { data, etag });
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> StoreResult<()> {
        // Removing an absent upload is a success; abort is idempotent.
        self.multiparts.remove(upload_id);
        Ok(())
    }

    async fn head(&self, key: &str) -> StoreResult<HeadObject> {
        let obj = self
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(HeadObject {
            size: obj.data.len() as u64,
            etag: obj.etag.clone(),
            last_modified: Some(Utc::now()),
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.objects.remove(key);
        Ok(())
    }

    async fn range_get(&self, key: &str, start: u64, end_inclusive: u64) -> StoreResult<Bytes> {
        let obj = self
            .objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let len = obj.data.len() as u64;
        if end_inclusive < start || start >= len || end_inclusive >= len {
            return Err(StoreError::PreconditionFailed(format!(
                "range {}..={} out of bounds for {} ({} bytes)",
                start, end_inclusive, key, len
            )));
        }
        Ok(obj.data.slice(start as usize..=end_inclusive as usize))
    }

    async fn list_incomplete_multipart(
        &self,
        prefix: Option<&str>,
    ) -> StoreResult<Vec<IncompleteUpload>> {
        let mut uploads: Vec<IncompleteUpload> = self
            .multiparts
            .iter()
            .filter(|entry| prefix.map_or(true, |p| entry.value().key.starts_with(p)))
            .map(|entry| IncompleteUpload {
                key: entry.value().key.clone(),
                upload_id: entry.key().clone(),
                initiated_at: Some(entry.value().initiated_at),
            })
            .collect();
        uploads.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(uploads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multipart_assembles_in_part_order() {
        let store = MemoryStore::new();
        let upload_id = store.initiate_multipart("k", "video/mp4").await.unwrap();

        let part1 = Bytes::from(vec![b'a'; MIN_PART_BYTES as usize]);
        let part2 = Bytes::from_static(b"tail");
        let e1 = store.upload_part(&upload_id, 1, part1.clone()).unwrap();
        let e2 = store.upload_part(&upload_id, 2, part2.clone()).unwrap();

        store
            .complete_multipart(
                "k",
                &upload_id,
                &[
                    CompletedPart {
                        part_number: 1,
                        etag: e1,
                    },
                    CompletedPart {
                        part_number: 2,
                        etag: e2,
                    },
                ],
            )
            .await
            .unwrap();

        let head = store.head("k").await.unwrap();
        assert_eq!(head.size, part1.len() as u64 + part2.len() as u64);
        assert!(!store.multipart_exists(&upload_id));

        let tail = store
            .range_get("k", part1.len() as u64, head.size - 1)
            .await
            .unwrap();
        assert_eq!(tail.as_ref(), b"tail");
    }

    #[tokio::test]
    async fn undersized_middle_part_is_rejected() {
        let store = MemoryStore::new();
        let upload_id = store.initiate_multipart("k", "video/mp4").await.unwrap();
        let e1 = store
            .upload_part(&upload_id, 1, Bytes::from_static(b"small"))
            .unwrap();
        let e2 = store
            .upload_part(&upload_id, 2, Bytes::from_static(b"tail"))
            .unwrap();

        let err = store
            .complete_multipart(
                "k",
                &upload_id,
                &[
                    CompletedPart {
                        part_number: 1,
                        etag: e1,
                    },
                    CompletedPart {
                        part_number: 2,
                        etag: e2,
                    },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let store = MemoryStore::new();
        let upload_id = store.initiate_multipart("k", "video/mp4").await.unwrap();
        store.abort_multipart("k", &upload_id).await.unwrap();
        store.abort_multipart("k", &upload_id).await.unwrap();
        assert!(!store.multipart_exists(&upload_id));
    }

    #[tokio::test]
    async fn bound_checksum_rejects_wrong_bytes() {
        let store = MemoryStore::new();
        let good = Bytes::from_static(b"expected content");
        let checksum = BASE64.encode(Sha256::digest(&good));

        store
            .mint_single_put("k", "video/mp4", Duration::from_secs(60), Some(&checksum))
            .await
            .unwrap();

        assert!(store.put_object("k", Bytes::from_static(b"tampered")).is_err());
        store.put_object("k", good).unwrap();
        assert!(store.object_exists("k"));
    }

    #[tokio::test]
    async fn range_get_bounds_checked() {
        let store = MemoryStore::new();
        store.put_object("k", Bytes::from_static(b"0123456789")).unwrap();
        assert_eq!(store.range_get("k", 2, 4).await.unwrap().as_ref(), b"234");
        assert!(store.range_get("k", 5, 20).await.is_err());
        assert!(store.range_get("missing", 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn listing_filters_by_prefix() {
        let store = MemoryStore::new();
        store.initiate_multipart("sources/a/original.mp4", "video/mp4").await.unwrap();
        store.initiate_multipart("other/b", "video/mp4").await.unwrap();

        let listed = store
            .list_incomplete_multipart(Some("sources/"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "sources/a/original.mp4");
    }
}
