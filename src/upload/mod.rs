//! Chunked Upload Module
//!
//! Implements resumable large file uploads with:
//! - Streaming chunk ingestion with SHA-256 digests
//! - Per-chunk AEAD encryption on a bounded worker pool
//! - A key chain linking every chunk to its successor's key
//! - Pause, resume, cancel and an idle-session expiry sweep
//!
//! Protocol Flow:
//! 1. Client starts an upload; a matching live session is resumed instead
//! 2. Client sends chunks in any order; processed chunks are skipped
//! 3. Each chunk is encrypted in the background under its own key
//! 4. Client completes the upload; the server links the key chain and
//!    hands the file off for registration

pub mod cipher;
pub mod engine;
pub mod finalize;
pub mod format;
pub mod ingest;
pub mod paths;
pub mod pipeline;
pub mod progress;
pub mod registrar;
pub mod session;
pub mod types;
pub mod validation;

pub use cipher::ChunkCipher;
pub use engine::UploadEngine;
pub use format::{decode_key, decrypt_chain, ProcessedChunk};
pub use registrar::{FileRegistrar, LoggingRegistrar, MemoryRegistrar, RegistrarError};
pub use session::SessionManager;
pub use types::*;
