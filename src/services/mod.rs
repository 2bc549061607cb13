pub mod authorization;
pub mod blob_store;
pub mod chunk_store;
pub mod cleanup;
pub mod derivative;
pub mod finalizer;
pub mod library;
pub mod reassembler;
pub mod records;
pub mod scheduler;
pub mod sweeper;
pub mod transcoder;
pub mod upload_session;
