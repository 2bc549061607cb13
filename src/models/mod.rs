//! Core data models of the upload service.
//!
//! Blob and record rows map to database tables via `sqlx::FromRow`; the rest
//! are plain values passed between services and serialized as JSON via `serde`.

pub mod blob;
pub mod job;
pub mod record;
pub mod request;
pub mod upload;
