//! Key chain assembly
//!
//! Appends to each processed chunk the key of the next chunk, closing the
//! ring with the key of chunk 0 on the last chunk. Only the initial key
//! leaves the server; every other key is recovered by walking the chain.

use std::io::{Error as IoError, ErrorKind};
use std::path::PathBuf;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use super::format::{chain_link, encode_key};
use super::types::{ChunkKey, UploadError, UploadSession};

/// Result of a completed key chain
#[derive(Debug, Clone)]
pub struct KeyChain {
    /// Processed chunk files, in chunk order
    pub processed_files: Vec<PathBuf>,

    /// Content digests, in chunk order
    pub chunk_digests: Vec<String>,

    /// Base64 key of chunk 0
    pub initial_key: String,
}

/// Link every processed chunk of `session` to its successor's key.
///
/// Chunks already linked by an earlier attempt are left alone, so a failed
/// finalize can be retried without appending a second link.
pub async fn assemble_key_chain(session: &UploadSession) -> Result<KeyChain, UploadError> {
    let total = session.total_chunks;

    let keys = (0..total)
        .map(|i| {
            session.chunk_key(i).ok_or_else(|| {
                IoError::new(ErrorKind::NotFound, format!("no key recorded for chunk {}", i))
            })
        })
        .collect::<Result<Vec<ChunkKey>, IoError>>()?;

    let chunk_digests = (0..total)
        .map(|i| {
            session.chunk_digest(i).ok_or_else(|| {
                IoError::new(ErrorKind::NotFound, format!("no digest recorded for chunk {}", i))
            })
        })
        .collect::<Result<Vec<String>, IoError>>()?;

    let mut processed_files = Vec::with_capacity(total);

    for i in 0..total {
        let path = session.dirs.processed_chunk(i);

        if !session.is_chained(i) {
            let next_key = &keys[(i + 1) % total];

            let mut file = OpenOptions::new().append(true).open(&path).await?;
            file.write_all(&chain_link(next_key)).await?;
            file.sync_all().await?;

            session.mark_chained(i);
        }

        processed_files.push(path);
    }

    tracing::debug!(session_id = %session.session_id, chunks = total, "Assembled key chain");

    Ok(KeyChain {
        processed_files,
        chunk_digests,
        initial_key: encode_key(&keys[0]),
    })
}
