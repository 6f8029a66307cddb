//! Chunkvault Server Library
//!
//! Resumable chunked uploads with per-chunk encryption. The server binary
//! is in main.rs; this crate exposes the engine for embedding and testing.
//!
//! # Modules
//!
//! - `upload`: Session store, chunk ingestion, encryption pool, finalizer
//! - `routes`: HTTP surface over the upload engine
//! - `config`: Environment-driven configuration
//! - `state`: Shared application state

pub mod config;
pub mod routes;
pub mod state;
pub mod upload;
