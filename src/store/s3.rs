//! S3-compatible object store adapter.
//!
//! Works against AWS S3, MinIO, R2, etc. Presigned URLs carry the only
//! client-facing credentials; the server itself never proxies upload bytes.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Builder, Credentials, Region},
    presigning::PresigningConfig,
    types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart},
    Client,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::adapter::{
    validate_part_list, with_retries, CompletedPart, HeadObject, IncompleteUpload, ObjectStore,
    StoreError, StoreResult,
};

/// S3 adapter configuration
#[derive(Clone, Debug)]
pub struct S3Config {
    /// Bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint URL (for MinIO, R2, etc.)
    pub endpoint: Option<String>,
    /// Force path-style URLs (required for MinIO)
    pub force_path_style: bool,
}

impl S3Config {
    /// Create config for AWS S3
    pub fn aws(bucket: String, region: String) -> Self {
        Self {
            bucket,
            region,
            endpoint: None,
            force_path_style: false,
        }
    }

    /// Create config for MinIO or other S3-compatible storage
    pub fn minio(bucket: String, endpoint: String) -> Self {
        Self {
            bucket,
            region: "us-east-1".to_string(), // MinIO doesn't care about region
            endpoint: Some(endpoint),
            force_path_style: true,
        }
    }
}

/// S3-compatible object store
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Create a new adapter from config, loading credentials from the
    /// environment.
    pub async fn new(config: S3Config) -> Self {
        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .force_path_style(config.force_path_style);

        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let sdk_config = aws_config::load_from_env().await;
        if let Some(creds) = sdk_config.credentials_provider() {
            builder = builder.credentials_provider(creds);
        }

        let client = Client::from_conf(builder.build());

        Self {
            client,
            bucket: config.bucket,
        }
    }

    /// Create an adapter with explicit credentials (for testing)
    pub fn with_credentials(config: S3Config, access_key: &str, secret_key: &str) -> Self {
        let creds = Credentials::new(access_key, secret_key, None, None, "static");

        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .force_path_style(config.force_path_style)
            .credentials_provider(creds);

        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
        }
    }

    fn presigning(ttl: Duration) -> StoreResult<PresigningConfig> {
        PresigningConfig::expires_in(ttl)
            .map_err(|e| StoreError::Permanent(format!("invalid presign TTL: {}", e)))
    }
}

/// Fold a provider error message into the local taxonomy. The SDK does not
/// expose a stable error enum across providers, so this matches on the
/// response text the way most S3 clients do.
fn classify(context: &str, msg: String) -> StoreError {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("nosuchkey")
        || lower.contains("nosuchupload")
        || lower.contains("notfound")
        || lower.contains("404")
    {
        StoreError::NotFound(context.to_string())
    } else if lower.contains("preconditionfailed")
        || lower.contains("412")
        || lower.contains("invalidpart")
        || lower.contains("entitytoosmall")
    {
        StoreError::PreconditionFailed(msg)
    } else if lower.contains("slowdown") || lower.contains("toomanyrequests") || lower.contains("429") {
        StoreError::Throttled(msg)
    } else if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("dispatch failure")
        || lower.contains("503")
        || lower.contains("internalerror")
        || lower.contains("500")
    {
        StoreError::Transient(msg)
    } else {
        StoreError::Permanent(msg)
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn mint_single_put(
        &self,
        key: &str,
        content_type: &str,
        ttl: Duration,
        checksum_sha256: Option<&str>,
    ) -> StoreResult<String> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type);
        if let Some(sum) = checksum_sha256 {
            req = req.checksum_sha256(sum);
        }
        let presigned = req
            .presigned(Self::presigning(ttl)?)
            .await
            .map_err(|e| classify(key, e.to_string()))?;
        Ok(presigned.uri().to_string())
    }

    async fn initiate_multipart(&self, key: &str, content_type: &str) -> StoreResult<String> {
        let out = with_retries(|| async {
            self.client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .content_type(content_type)
                .send()
                .await
                .map_err(|e| classify(key, e.to_string()))
        })
        .await?;

        out.upload_id()
            .map(|id| id.to_string())
            .ok_or_else(|| StoreError::Permanent("provider returned no upload id".to_string()))
    }

    async fn mint_part_put(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> StoreResult<String> {
        let presigned = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .presigned(Self::presigning(ttl)?)
            .await
            .map_err(|e| classify(key, e.to_string()))?;
        Ok(presigned.uri().to_string())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StoreResult<()> {
        validate_part_list(parts)?;

        let completed: Vec<S3CompletedPart> = parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        with_retries(|| async {
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed.clone()))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| classify(key, e.to_string()))
        })
        .await?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StoreResult<()> {
        let result = with_retries(|| async {
            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .send()
                .await
                .map_err(|e| classify(key, e.to_string()))
        })
        .await;

        match result {
            Ok(_) => Ok(()),
            // Aborting something already gone is a success.
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn head(&self, key: &str) -> StoreResult<HeadObject> {
        let out = with_retries(|| async {
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| classify(key, e.to_string()))
        })
        .await?;

        Ok(HeadObject {
            size: out.content_length().unwrap_or(0) as u64,
            etag: out.e_tag().unwrap_or_default().to_string(),
            last_modified: out.last_modified().and_then(to_chrono),
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let result = with_retries(|| async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| classify(key, e.to_string()))
        })
        .await;

        match result {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn range_get(&self, key: &str, start: u64, end_inclusive: u64) -> StoreResult<Bytes> {
        if end_inclusive < start {
            return Err(StoreError::PreconditionFailed(format!(
                "invalid range {}..={}",
                start, end_inclusive
            )));
        }
        let out = with_retries(|| async {
            self.client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .range(format!("bytes={}-{}", start, end_inclusive))
                .send()
                .await
                .map_err(|e| {
                    let msg = e.to_string();
                    if msg.contains("InvalidRange") || msg.contains("416") {
                        StoreError::PreconditionFailed(format!(
                            "range {}..={} out of bounds for {}",
                            start, end_inclusive, key
                        ))
                    } else {
                        classify(key, msg)
                    }
                })
        })
        .await?;

        let data = out
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        Ok(data.into_bytes())
    }

    async fn list_incomplete_multipart(
        &self,
        prefix: Option<&str>,
    ) -> StoreResult<Vec<IncompleteUpload>> {
        let mut uploads = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;

        loop {
            let mut req = self.client.list_multipart_uploads().bucket(&self.bucket);
            if let Some(p) = prefix {
                req = req.prefix(p);
            }
            if let Some(km) = &key_marker {
                req = req.key_marker(km);
            }
            if let Some(um) = &upload_id_marker {
                req = req.upload_id_marker(um);
            }

            let out = with_retries(|| {
                let req = req.clone();
                async move {
                    req.send()
                        .await
                        .map_err(|e| classify("list-multipart", e.to_string()))
                }
            })
            .await?;

            for upload in out.uploads() {
                if let (Some(key), Some(id)) = (upload.key(), upload.upload_id()) {
                    uploads.push(IncompleteUpload {
                        key: key.to_string(),
                        upload_id: id.to_string(),
                        initiated_at: upload.initiated().and_then(to_chrono),
                    });
                }
            }

            if out.is_truncated().unwrap_or(false) {
                key_marker = out.next_key_marker().map(|s| s.to_string());
                upload_id_marker = out.next_upload_id_marker().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(uploads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(matches!(
            classify("k", "NoSuchKey: the key does not exist".into()),
            StoreError::NotFound(_)
        ));
        assert!(matches!(
            classify("k", "SlowDown: reduce request rate".into()),
            StoreError::Throttled(_)
        ));
        assert!(matches!(
            classify("k", "dispatch failure: connection reset".into()),
            StoreError::Transient(_)
        ));
        assert!(matches!(
            classify("k", "InvalidPart: part etag mismatch".into()),
            StoreError::PreconditionFailed(_)
        ));
        assert!(matches!(
            classify("k", "AccessDenied".into()),
            StoreError::Permanent(_)
        ));
    }
}
