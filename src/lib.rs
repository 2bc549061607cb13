//! Chunked upload and finalization service.
//!
//! Clients upload large media files as numbered chunks. Finalizing a session
//! concatenates the chunks in index order, optionally runs them through
//! ffmpeg (compression, trimming, thumbnails), stores the results as blobs and
//! records them in SQLite.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
