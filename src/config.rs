//! Runtime configuration.
//!
//! Everything is environment-driven with production defaults. `Config` is
//! built once at startup and handed to components through `AppState` so tests
//! can construct variants directly.

use std::path::PathBuf;
use std::time::Duration;

/// Smallest part size an S3-compatible provider accepts for any part except
/// the last (5 MiB).
pub const MIN_PART_BYTES: u64 = 5 * 1024 * 1024;

/// Largest size of a single part (5 GiB).
pub const MAX_PART_BYTES: u64 = 5 * 1024 * 1024 * 1024;

/// Completed jobs retained before pruning.
pub const COMPLETED_JOB_RETENTION: u64 = 100;

/// Dead (permanently failed) jobs retained before pruning.
pub const DEAD_JOB_RETENTION: u64 = 1000;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Directory for the SQLite database when `database_url` is unset.
    pub data_dir: PathBuf,
    pub database_url: Option<String>,

    /// Object-store bucket. When empty the server falls back to the
    /// in-memory store (development only).
    pub bucket: String,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    pub s3_force_path_style: bool,

    /// Reject `POST /uploads` declaring more bytes than this.
    pub max_file_size: u64,
    /// Above this declared size, the session is multipart.
    pub multipart_threshold: u64,
    pub multipart_chunk_bytes: u64,
    pub max_multipart_parts: u32,
    /// Presigned URL validity, also the session completion window.
    pub presign_ttl: Duration,

    /// Multipart uploads older than this are swept by the collector.
    pub abandoned_ttl: Duration,
    pub collector_cadence: Duration,

    /// Concurrent ranged reads during part-checksum validation.
    pub validation_parallelism: usize,
    /// Wall-clock budget for the whole checksum validation of one video.
    pub max_validation_wall: Duration,

    pub queue_attempts: u32,
    pub queue_backoff_base: Duration,

    /// Per-subscriber fan-out queue depth; overflow drops oldest.
    pub subscriber_queue_depth: usize,

    /// Whether single-PUT uploads materialize an UploadSession row
    /// (total_parts = 1).
    pub persist_single_part_sessions: bool,

    /// Dev mode relaxes the queue retry budget to a single attempt.
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            data_dir: std::env::temp_dir().join("vodgate"),
            database_url: None,
            bucket: String::new(),
            s3_region: "us-east-1".to_string(),
            s3_endpoint: None,
            s3_force_path_style: false,
            max_file_size: 10 * 1024 * 1024 * 1024,
            multipart_threshold: 100 * 1024 * 1024,
            multipart_chunk_bytes: 50 * 1024 * 1024,
            max_multipart_parts: 10_000,
            presign_ttl: Duration::from_secs(3600),
            abandoned_ttl: Duration::from_secs(24 * 3600),
            collector_cadence: Duration::from_secs(6 * 3600),
            validation_parallelism: 5,
            max_validation_wall: Duration::from_secs(120),
            queue_attempts: 3,
            queue_backoff_base: Duration::from_secs(5),
            subscriber_queue_depth: 64,
            persist_single_part_sessions: true,
            dev_mode: false,
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("VODGATE_{}", key)).ok()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env_var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl Config {
    /// Build configuration from `VODGATE_*` environment variables,
    /// falling back to production defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let dev_mode = env_bool("DEV_MODE", defaults.dev_mode);
        Self {
            host: env_var("HOST").unwrap_or(defaults.host),
            port: env_parse("PORT", defaults.port),
            data_dir: env_var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            database_url: env_var("DATABASE_URL"),
            bucket: env_var("BUCKET").unwrap_or(defaults.bucket),
            s3_region: env_var("S3_REGION").unwrap_or(defaults.s3_region),
            s3_endpoint: env_var("S3_ENDPOINT"),
            s3_force_path_style: env_bool("S3_FORCE_PATH_STYLE", defaults.s3_force_path_style),
            max_file_size: env_parse("MAX_FILE_SIZE", defaults.max_file_size),
            multipart_threshold: env_parse("MULTIPART_THRESHOLD", defaults.multipart_threshold),
            multipart_chunk_bytes: env_parse(
                "MULTIPART_CHUNK_BYTES",
                defaults.multipart_chunk_bytes,
            ),
            max_multipart_parts: env_parse("MAX_MULTIPART_PARTS", defaults.max_multipart_parts),
            presign_ttl: Duration::from_secs(env_parse("PRESIGN_TTL_S", 3600u64)),
            abandoned_ttl: Duration::from_secs(env_parse("ABANDONED_TTL_H", 24u64) * 3600),
            collector_cadence: Duration::from_secs(env_parse("COLLECTOR_CADENCE_H", 6u64) * 3600),
            validation_parallelism: env_parse(
                "VALIDATION_PARALLELISM",
                defaults.validation_parallelism,
            ),
            max_validation_wall: Duration::from_secs(env_parse("MAX_VALIDATION_WALL_S", 120u64)),
            queue_attempts: if dev_mode {
                1
            } else {
                env_parse("QUEUE_ATTEMPTS", defaults.queue_attempts)
            },
            queue_backoff_base: Duration::from_secs(env_parse("QUEUE_BACKOFF_BASE_S", 5u64)),
            subscriber_queue_depth: env_parse(
                "SUBSCRIBER_QUEUE_DEPTH",
                defaults.subscriber_queue_depth,
            ),
            persist_single_part_sessions: env_bool(
                "PERSIST_SINGLE_PART_SESSIONS",
                defaults.persist_single_part_sessions,
            ),
            dev_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let c = Config::default();
        assert_eq!(c.max_file_size, 10 * 1024 * 1024 * 1024);
        assert_eq!(c.multipart_threshold, 100 * 1024 * 1024);
        assert_eq!(c.multipart_chunk_bytes, 50 * 1024 * 1024);
        assert_eq!(c.max_multipart_parts, 10_000);
        assert_eq!(c.presign_ttl, Duration::from_secs(3600));
        assert_eq!(c.subscriber_queue_depth, 64);
        assert_eq!(c.queue_attempts, 3);
    }

    #[test]
    fn chunk_size_respects_provider_bounds() {
        let c = Config::default();
        assert!(c.multipart_chunk_bytes >= MIN_PART_BYTES);
        assert!(c.multipart_chunk_bytes <= MAX_PART_BYTES);
    }
}
