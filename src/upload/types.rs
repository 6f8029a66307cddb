//! Upload types for the chunked encryption pipeline

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::paths::SessionDirs;

// ============================================================================
// Constants
// ============================================================================

/// Default chunk size: 5MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum file size: 4GiB
pub const MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Session inactivity TTL: 24 hours
pub const SESSION_TTL_HOURS: i64 = 24;

/// Symmetric key length in bytes (256-bit)
pub const KEY_LEN: usize = 32;

/// AEAD nonce length in bytes (96-bit)
pub const NONCE_LEN: usize = 12;

/// AEAD authentication tag length in bytes (128-bit)
pub const TAG_LEN: usize = 16;

/// Separator written before the content digest of a processed chunk
pub const HASH_SEPARATOR: &[u8] = b"\n--HASH--\n";

/// Separator written before the next chunk's key during finalization
pub const KEY_SEPARATOR: &[u8] = b"\n--NEXT_KEY--\n";

/// Per-chunk symmetric key
pub type ChunkKey = [u8; KEY_LEN];

/// Number of chunks a file of `file_size` bytes splits into.
///
/// A zero-byte file still occupies a single (empty) chunk with index 0.
pub fn total_chunks_for(file_size: u64, chunk_size: u64) -> usize {
    if file_size == 0 || chunk_size == 0 {
        return 1;
    }
    file_size.div_ceil(chunk_size) as usize
}

// ============================================================================
// Start Types
// ============================================================================

/// Request to start (or resume) a chunked upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadRequest {
    /// Client-side file name
    pub file_name: String,

    /// Total file size in bytes
    pub file_size: u64,

    /// MIME type of the file
    pub content_type: String,

    /// Optional: caller-chosen client id, used with the file name for resumption
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Response to a start request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadResponse {
    pub session_id: String,
    pub client_id: String,
    pub chunk_size: u64,
    pub total_chunks: usize,

    /// Whether an existing session was resumed
    pub resumed: bool,

    /// Chunks that are already encrypted and need not be sent again
    pub processed_chunks: Vec<usize>,
}

// ============================================================================
// Chunk Upload Types
// ============================================================================

/// Response after uploading a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub chunk_index: usize,

    /// The chunk was already processed and the bytes were ignored
    pub skipped: bool,

    pub uploaded_chunks: usize,
    pub processed_chunks: usize,
    pub total_chunks: usize,
}

// ============================================================================
// Lifecycle Types
// ============================================================================

/// Response after resuming a paused upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeUploadResponse {
    pub processed_chunks: Vec<usize>,
    pub total_chunks: usize,
}

/// Everything a finished upload hands to the file registrar
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedUpload {
    pub session_id: String,
    pub client_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub total_chunks: usize,

    /// Processed chunk files, in chunk order
    pub processed_files: Vec<PathBuf>,

    /// Base64 content digests, in chunk order
    pub chunk_digests: Vec<String>,

    /// Base64 key of chunk 0, the entry point of the key chain
    #[serde(skip_serializing)]
    pub initial_key: String,
}

/// Response after completing an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    pub client_id: String,
    pub file_name: String,
    pub total_chunks: usize,
}

// ============================================================================
// Status Types
// ============================================================================

/// Coarse upload state for status polling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadState {
    Paused,
    ProcessingComplete,
    Uploading,
}

/// Weighted progress snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressInfo {
    pub total_chunks: usize,
    pub uploaded_chunks: usize,
    pub processed_chunks: usize,
    pub upload_percent: u8,
    pub process_percent: u8,
    pub total_percent: u8,
}

/// Response for `get_progress`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressResponse {
    pub session_id: String,
    pub client_id: String,
    #[serde(flatten)]
    pub progress: ProgressInfo,
}

/// Response for `check_status`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub session_id: String,
    pub client_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub paused: bool,
    pub state: UploadState,
    pub progress: ProgressInfo,
    pub processed_chunks: Vec<usize>,

    /// Uploaded chunks whose encryption has not (yet) produced an artifact
    pub stalled_chunks: Vec<usize>,
}

// ============================================================================
// Session Types
// ============================================================================

/// Server-side record of one in-progress upload.
///
/// Immutable identity fields are plain; per-chunk bookkeeping lives in
/// concurrent containers so unrelated chunks never contend on one lock.
#[derive(Debug)]
pub struct UploadSession {
    pub session_id: String,
    pub client_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub content_type: String,
    pub chunk_size: u64,
    pub total_chunks: usize,
    pub dirs: SessionDirs,
    pub created_at: DateTime<Utc>,

    uploaded_chunks: DashSet<usize>,
    processed_chunks: DashSet<usize>,
    chunk_keys: DashMap<usize, ChunkKey>,
    chunk_digests: DashMap<usize, String>,

    /// Chunks whose next-key link has been appended by the finalizer
    chained_chunks: DashSet<usize>,

    /// Latest upload attempt per chunk. The lock also guards installing
    /// processed artifacts, so a claim and a commit never interleave.
    chunk_generations: Mutex<HashMap<usize, u64>>,

    last_activity_at: Mutex<DateTime<Utc>>,
    last_progress_log_at: Mutex<Option<DateTime<Utc>>>,

    /// Set once the session left the store; late encryption results are ignored
    closed: AtomicBool,

    /// Serializes `complete_upload` attempts
    pub(crate) finalize_lock: tokio::sync::Mutex<()>,
}

impl UploadSession {
    /// Create a new upload session
    pub fn new(
        session_id: String,
        client_id: String,
        request: &StartUploadRequest,
        chunk_size: u64,
        dirs: SessionDirs,
    ) -> Self {
        let now = Utc::now();

        Self {
            session_id,
            client_id,
            file_name: request.file_name.clone(),
            file_size: request.file_size,
            content_type: request.content_type.clone(),
            chunk_size,
            total_chunks: total_chunks_for(request.file_size, chunk_size),
            dirs,
            created_at: now,
            uploaded_chunks: DashSet::new(),
            processed_chunks: DashSet::new(),
            chunk_keys: DashMap::new(),
            chunk_digests: DashMap::new(),
            chained_chunks: DashSet::new(),
            chunk_generations: Mutex::new(HashMap::new()),
            last_activity_at: Mutex::new(now),
            last_progress_log_at: Mutex::new(None),
            closed: AtomicBool::new(false),
            finalize_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Refresh the inactivity clock
    pub fn touch(&self) {
        *self.last_activity_at.lock() = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity_at.lock()
    }

    pub(crate) fn set_last_activity(&self, at: DateTime<Utc>) {
        *self.last_activity_at.lock() = at;
    }

    /// Returns true at most once per `interval`, claiming the next progress log slot
    pub(crate) fn claim_progress_log(&self, interval: chrono::Duration) -> bool {
        let now = Utc::now();
        let mut last = self.last_progress_log_at.lock();
        match *last {
            Some(at) if now.signed_duration_since(at) < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        let _generations = self.chunk_generations.lock();
        self.closed.store(true, Ordering::Release);
    }

    // ------------------------------------------------------------------------
    // Chunk bookkeeping
    // ------------------------------------------------------------------------

    /// Claim a new upload attempt for `index`.
    ///
    /// Returns `None` once the chunk is processed; its artifact is final and
    /// further uploads are ignored. Any attempt claimed earlier is superseded.
    pub(crate) fn begin_upload(&self, index: usize) -> Option<u64> {
        let mut generations = self.chunk_generations.lock();
        if self.processed_chunks.contains(&index) {
            return None;
        }
        let generation = generations.entry(index).or_insert(0);
        *generation += 1;
        Some(*generation)
    }

    pub fn current_generation(&self, index: usize) -> u64 {
        self.chunk_generations.lock().get(&index).copied().unwrap_or(0)
    }

    /// Install the artifact sealed for attempt `generation` of chunk `index`.
    ///
    /// `staged` is renamed onto `target` and the chunk recorded as processed
    /// only while the session is open, the chunk is not yet processed, and
    /// `generation` is still the latest attempt. Returns `Ok(false)` when the
    /// result was discarded; `staged` is then left for the caller.
    pub(crate) fn commit_processed(
        &self,
        index: usize,
        generation: u64,
        staged: &Path,
        target: &Path,
        key: ChunkKey,
        digest: String,
    ) -> std::io::Result<bool> {
        let generations = self.chunk_generations.lock();
        let current = generations.get(&index).copied().unwrap_or(0);

        if self.is_closed() || current != generation || self.processed_chunks.contains(&index) {
            return Ok(false);
        }

        std::fs::rename(staged, target)?;
        self.record_processed(index, key, digest);
        Ok(true)
    }

    pub(crate) fn record_uploaded(&self, index: usize, digest: String) {
        self.chunk_digests.insert(index, digest);
        self.uploaded_chunks.insert(index);
    }

    /// The digest is the one sealed into the artifact, which wins over the ingest digest
    pub(crate) fn record_processed(&self, index: usize, key: ChunkKey, digest: String) {
        self.chunk_digests.insert(index, digest);
        self.chunk_keys.insert(index, key);
        self.processed_chunks.insert(index);
    }

    #[cfg(test)]
    pub(crate) fn forget_processed(&self, index: usize) {
        self.processed_chunks.remove(&index);
        self.chunk_keys.remove(&index);
    }

    pub(crate) fn mark_chained(&self, index: usize) -> bool {
        self.chained_chunks.insert(index)
    }

    pub(crate) fn is_chained(&self, index: usize) -> bool {
        self.chained_chunks.contains(&index)
    }

    pub fn is_processed(&self, index: usize) -> bool {
        self.processed_chunks.contains(&index)
    }

    pub fn uploaded_count(&self) -> usize {
        self.uploaded_chunks.len()
    }

    pub fn processed_count(&self) -> usize {
        self.processed_chunks.len()
    }

    /// Check if every chunk has an encrypted artifact
    pub fn is_fully_processed(&self) -> bool {
        self.processed_chunks.len() == self.total_chunks
    }

    /// Sorted indices of processed chunks
    pub fn processed_list(&self) -> Vec<usize> {
        let set: BTreeSet<usize> = self.processed_chunks.iter().map(|i| *i).collect();
        set.into_iter().collect()
    }

    /// Sorted indices of chunks uploaded but not processed
    pub fn stalled_chunks(&self) -> Vec<usize> {
        let set: BTreeSet<usize> = self
            .uploaded_chunks
            .iter()
            .map(|i| *i)
            .filter(|i| !self.processed_chunks.contains(i))
            .collect();
        set.into_iter().collect()
    }

    pub fn chunk_key(&self, index: usize) -> Option<ChunkKey> {
        self.chunk_keys.get(&index).map(|k| *k)
    }

    pub fn chunk_digest(&self, index: usize) -> Option<String> {
        self.chunk_digests.get(&index).map(|d| d.clone())
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session paused: {0}")]
    SessionPaused(String),

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Processing incomplete: {processed} of {total} chunks encrypted")]
    IncompleteProcessing { processed: usize, total: usize },

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("File registration failed: {0}")]
    Handoff(String),
}

impl UploadError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::SessionPaused(_) => "SESSION_PAUSED",
            Self::Io(_) => "IO_ERROR",
            Self::Crypto(_) => "CRYPTO_ERROR",
            Self::IncompleteProcessing { .. } => "INCOMPLETE_PROCESSING",
            Self::Interrupted(_) => "INTERRUPTED",
            Self::Handoff(_) => "HANDOFF_FAILED",
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionPaused(_) => StatusCode::LOCKED,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::IncompleteProcessing { .. } => StatusCode::CONFLICT,
            Self::Interrupted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Handoff(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
