//! Ingest protocol: session selection, presigned URL lifecycle, per-part
//! checksum registry, and completion validation.

mod checksum;
mod session;

pub use checksum::{is_valid_sha256_b64, verify_ranges, verify_whole, ChecksumFailure, RangeSpec};
pub use session::{
    plan_session, CompletionRequest, CreatedUpload, MintedSession, NewUpload, PartChecksum,
    RefreshedUrls, SessionPlan, UploadSessionManager,
};
