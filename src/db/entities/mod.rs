//! Database entities

pub mod segment;
pub mod transcode_job;
pub mod upload_session;
pub mod video;
