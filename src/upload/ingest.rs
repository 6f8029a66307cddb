//! Chunk ingestion
//!
//! Streams one chunk body to its raw staging file while hashing it.

use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use super::paths::staging_sibling;
use super::types::UploadError;

/// Read buffer size for streaming chunk bodies
const READ_BUF_SIZE: usize = 64 * 1024;

/// A chunk that reached durable storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedChunk {
    pub bytes_written: u64,

    /// URL-safe base64 (no padding) SHA-256 of the bytes written
    pub digest: String,
}

/// Compute the content digest of a chunk
pub fn compute_digest(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(data))
}

/// Stream `reader` into `path`, hashing as it goes.
///
/// The body is written to a private sibling file, synced, then renamed over
/// `path`. Readers of `path` see either the previous chunk or the new one,
/// never a partial write. On failure the sibling is removed and any previous
/// chunk at `path` is left untouched.
/// Bodies larger than `limit` bytes, or empty bodies, are rejected.
pub async fn persist_chunk<R>(path: &Path, reader: R, limit: u64) -> Result<PersistedChunk, UploadError>
where
    R: AsyncRead + Unpin,
{
    let staging = staging_sibling(path);

    let result = match write_hashed(&staging, reader, limit).await {
        Ok(chunk) => tokio::fs::rename(&staging, path)
            .await
            .map(|_| chunk)
            .map_err(UploadError::from),
        Err(e) => Err(e),
    };

    if result.is_err() {
        if let Err(rm) = tokio::fs::remove_file(&staging).await {
            if rm.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %staging.display(), error = %rm, "Failed to remove partial chunk");
            }
        }
    }
    result
}

async fn write_hashed<R>(path: &Path, mut reader: R, limit: u64) -> Result<PersistedChunk, UploadError>
where
    R: AsyncRead + Unpin,
{
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut written: u64 = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        written += n as u64;
        if written > limit {
            return Err(UploadError::validation(
                "chunk",
                format!("chunk exceeds the chunk size of {} bytes", limit),
            ));
        }

        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
    }

    if written == 0 {
        return Err(UploadError::validation("chunk", "chunk body is empty"));
    }

    file.flush().await?;
    file.sync_all().await?;

    Ok(PersistedChunk {
        bytes_written: written,
        digest: URL_SAFE_NO_PAD.encode(hasher.finalize()),
    })
}
