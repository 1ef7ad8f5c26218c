//! Object-store adapter.
//!
//! A pluggable contract over S3-compatible storage:
//! - `S3Store` for AWS S3, MinIO, R2, etc.
//! - `MemoryStore` as the development fallback and test double
//!
//! All orchestration code depends only on the [`ObjectStore`] trait.

#![allow(dead_code)] // Parts of the adapter surface are worker/test-facing

mod adapter;
pub mod keys;
mod memory;
mod s3;

pub use adapter::{
    validate_part_list, with_retries, CompletedPart, HeadObject, IncompleteUpload, ObjectStore,
    StoreError, StoreResult,
};
pub use memory::MemoryStore;
pub use s3::{S3Config, S3Store};
