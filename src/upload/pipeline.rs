//! Encryption Pipeline
//!
//! A fixed set of workers drains a bounded job queue. Each job reads one raw
//! chunk, seals it under a fresh key and nonce into a staging file, and
//! commits that file as the processed artifact only if its upload attempt is
//! still the latest one. When the queue is full, or the pool is not running,
//! the submitting task runs the job itself; no job is ever dropped.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::cipher::ChunkCipher;
use super::format::encode_sealed;
use super::ingest::compute_digest;
use super::paths::staging_sibling;
use super::types::{ChunkKey, UploadError, UploadSession};

/// One chunk waiting to be encrypted
#[derive(Debug)]
pub struct EncryptionJob {
    pub session: Arc<UploadSession>,
    pub index: usize,

    /// Upload attempt this job encrypts
    pub generation: u64,

    pub raw_path: PathBuf,
    pub processed_path: PathBuf,
}

impl EncryptionJob {
    pub fn new(session: Arc<UploadSession>, index: usize, generation: u64) -> Self {
        let raw_path = session.dirs.raw_chunk(index);
        let processed_path = session.dirs.processed_chunk(index);
        Self {
            session,
            index,
            generation,
            raw_path,
            processed_path,
        }
    }
}

// ============================================================================
// Encryption Pool
// ============================================================================

/// Bounded worker pool for chunk encryption
#[derive(Clone)]
pub struct EncryptionPool {
    inner: Arc<EncryptionPoolInner>,
}

struct EncryptionPoolInner {
    cipher: ChunkCipher,

    /// Number of worker tasks
    workers: usize,

    /// Queue capacity before submitters run jobs themselves
    capacity: usize,

    /// Present while the pool is running
    sender: Mutex<Option<mpsc::Sender<EncryptionJob>>>,

    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl EncryptionPool {
    pub fn new(cipher: ChunkCipher, workers: usize, capacity: usize) -> Self {
        Self {
            inner: Arc::new(EncryptionPoolInner {
                cipher,
                workers: workers.max(1),
                capacity: capacity.max(1),
                sender: Mutex::new(None),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.sender.lock().is_some()
    }

    /// Spawn the workers. Calling this on a running pool does nothing.
    pub fn start(&self) {
        let mut sender = self.inner.sender.lock();
        if sender.is_some() {
            return;
        }

        let (tx, rx) = mpsc::channel::<EncryptionJob>(self.inner.capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let cipher = self.inner.cipher;

        let mut handles = self.inner.handles.lock();
        for worker in 0..self.inner.workers {
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => run_job(cipher, job).await,
                        None => break,
                    }
                }
                tracing::debug!(worker, "Encryption worker stopped");
            }));
        }

        *sender = Some(tx);

        tracing::info!(
            workers = self.inner.workers,
            capacity = self.inner.capacity,
            cipher = %cipher,
            "Started encryption pool"
        );
    }

    /// Jobs accepted but not yet picked up by a worker
    pub fn queued(&self) -> usize {
        match self.inner.sender.lock().as_ref() {
            Some(tx) => tx.max_capacity() - tx.capacity(),
            None => 0,
        }
    }

    /// Queue a job, or run it on the calling task if the queue cannot take it
    pub async fn submit(&self, job: EncryptionJob) {
        let sender = self.inner.sender.lock().clone();

        let job = match sender {
            Some(tx) => match tx.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(job)) => {
                    tracing::warn!(
                        session_id = %job.session.session_id,
                        chunk_index = job.index,
                        "Encryption queue full, running on caller"
                    );
                    job
                }
                Err(TrySendError::Closed(job)) => job,
            },
            None => {
                tracing::debug!(
                    session_id = %job.session.session_id,
                    chunk_index = job.index,
                    "Encryption pool not running, running on caller"
                );
                job
            }
        };

        run_job(self.inner.cipher, job).await;
    }

    /// Close the queue and wait up to `drain_timeout` for queued jobs to finish.
    ///
    /// Workers still busy after the timeout are aborted.
    pub async fn stop(&self, drain_timeout: Duration) {
        let Some(sender) = self.inner.sender.lock().take() else {
            return;
        };
        drop(sender);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.handles.lock());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        match tokio::time::timeout(drain_timeout, join_all(handles)).await {
            Ok(_) => tracing::info!("Encryption pool drained"),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = drain_timeout.as_secs(),
                    "Encryption pool drain timed out, aborting workers"
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }
}

// ============================================================================
// Job Execution
// ============================================================================

async fn run_job(cipher: ChunkCipher, job: EncryptionJob) {
    if job.session.is_closed() {
        tracing::debug!(session_id = %job.session.session_id, chunk_index = job.index, "Skipping chunk of closed session");
        return;
    }

    let session = Arc::clone(&job.session);
    let (index, generation) = (job.index, job.generation);

    let result = tokio::task::spawn_blocking(move || {
        let staged = staging_sibling(&job.processed_path);
        let outcome = seal_and_commit(cipher, &job, &staged);
        if !matches!(outcome, Ok(true)) {
            let _ = std::fs::remove_file(&staged);
        }
        outcome
    })
    .await
    .map_err(|e| UploadError::Crypto(format!("Task join error: {}", e)))
    .and_then(|r| r);

    match result {
        Ok(true) => {
            tracing::debug!(
                session_id = %session.session_id,
                chunk_index = index,
                generation,
                processed = session.processed_count(),
                total = session.total_chunks,
                "Encrypted chunk"
            );
        }
        Ok(false) => {
            tracing::debug!(
                session_id = %session.session_id,
                chunk_index = index,
                generation,
                current = session.current_generation(index),
                "Discarded superseded encryption result"
            );
        }
        Err(e) if session.is_closed() => {
            tracing::debug!(session_id = %session.session_id, chunk_index = index, error = %e, "Chunk of closed session failed");
        }
        Err(e) => {
            tracing::error!(
                session_id = %session.session_id,
                chunk_index = index,
                generation,
                error = %e,
                "Failed to encrypt chunk"
            );
        }
    }
}

/// Seal the job's raw chunk into `staged`, then try to install it
fn seal_and_commit(cipher: ChunkCipher, job: &EncryptionJob, staged: &Path) -> Result<bool, UploadError> {
    let (key, digest) = encrypt_chunk(cipher, &job.raw_path, staged)?;
    let committed = job.session.commit_processed(
        job.index,
        job.generation,
        staged,
        &job.processed_path,
        key,
        digest,
    )?;
    Ok(committed)
}

/// Seal one raw chunk into its processed artifact.
///
/// Returns the fresh key and the digest of the plaintext that was sealed.
/// `processed_path` is created or truncated.
pub fn encrypt_chunk(
    cipher: ChunkCipher,
    raw_path: &Path,
    processed_path: &Path,
) -> Result<(ChunkKey, String), UploadError> {
    let plaintext = std::fs::read(raw_path)?;
    let digest = compute_digest(&plaintext);

    let key = ChunkCipher::generate_key();
    let nonce = ChunkCipher::generate_nonce();
    let ciphertext = cipher.encrypt(&key, &nonce, &plaintext)?;

    let mut file = std::fs::File::create(processed_path)?;
    file.write_all(&encode_sealed(&nonce, &ciphertext, &digest))?;
    file.sync_all()?;

    Ok((key, digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::finalize::assemble_key_chain;
    use crate::upload::format::ProcessedChunk;
    use crate::upload::paths::StagingLayout;
    use crate::upload::types::StartUploadRequest;
    use tempfile::TempDir;

    async fn session_in(temp_dir: &TempDir, total_bytes: u64, chunk_size: u64) -> Arc<UploadSession> {
        let layout = StagingLayout::new(temp_dir.path().join("raw"), temp_dir.path().join("out"));
        let dirs = layout.session_dirs("client", "session");
        dirs.create().await.unwrap();

        let request = StartUploadRequest {
            file_name: "a.txt".to_string(),
            file_size: total_bytes,
            content_type: "text/plain".to_string(),
            client_id: None,
        };
        Arc::new(UploadSession::new(
            "session".to_string(),
            "client".to_string(),
            &request,
            chunk_size,
            dirs,
        ))
    }

    fn job_for(session: &Arc<UploadSession>, index: usize) -> EncryptionJob {
        let generation = session.begin_upload(index).unwrap();
        EncryptionJob::new(Arc::clone(session), index, generation)
    }

    fn processed_entries(session: &UploadSession) -> usize {
        std::fs::read_dir(&session.dirs.processed).unwrap().count()
    }

    async fn wait_processed(session: &UploadSession, count: usize) {
        for _ in 0..200 {
            if session.processed_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} processed chunks, got {}", count, session.processed_count());
    }

    #[test]
    fn test_encrypt_chunk_writes_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let raw = temp_dir.path().join("chunk_0");
        let out = temp_dir.path().join("encrypted_chunk_0");
        std::fs::write(&raw, b"plain bytes").unwrap();

        let (key, digest) = encrypt_chunk(ChunkCipher::AesGcm, &raw, &out).unwrap();

        let parsed = ProcessedChunk::parse(&std::fs::read(&out).unwrap()).unwrap();
        assert_eq!(parsed.digest, digest);
        assert_eq!(parsed.open(ChunkCipher::AesGcm, &key).unwrap(), b"plain bytes");
    }

    #[tokio::test]
    async fn test_pool_processes_submitted_jobs() {
        let temp_dir = TempDir::new().unwrap();
        let session = session_in(&temp_dir, 8, 2).await;
        for i in 0..4 {
            tokio::fs::write(session.dirs.raw_chunk(i), [i as u8; 2]).await.unwrap();
        }

        let pool = EncryptionPool::new(ChunkCipher::ChaCha20, 2, 16);
        pool.start();
        assert!(pool.is_running());

        for i in 0..4 {
            pool.submit(job_for(&session, i)).await;
        }
        wait_processed(&session, 4).await;
        assert!(session.is_fully_processed());

        pool.stop(Duration::from_secs(5)).await;
        assert!(!pool.is_running());
        assert_eq!(pool.queued(), 0);
    }

    #[tokio::test]
    async fn test_stopped_pool_runs_on_caller() {
        let temp_dir = TempDir::new().unwrap();
        let session = session_in(&temp_dir, 2, 2).await;
        tokio::fs::write(session.dirs.raw_chunk(0), b"xy").await.unwrap();

        let pool = EncryptionPool::new(ChunkCipher::AesGcm, 1, 1);
        pool.submit(job_for(&session, 0)).await;

        // Ran inline, so it is done as soon as submit returns
        assert!(session.is_processed(0));
        assert!(session.dirs.processed_chunk(0).exists());
    }

    #[tokio::test]
    async fn test_missing_raw_chunk_is_not_recorded() {
        let temp_dir = TempDir::new().unwrap();
        let session = session_in(&temp_dir, 2, 2).await;

        let pool = EncryptionPool::new(ChunkCipher::AesGcm, 1, 1);
        pool.submit(job_for(&session, 0)).await;

        assert!(!session.is_processed(0));
        assert!(session.chunk_key(0).is_none());
        assert_eq!(processed_entries(&session), 0);
    }

    #[tokio::test]
    async fn test_closed_session_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let session = session_in(&temp_dir, 2, 2).await;
        tokio::fs::write(session.dirs.raw_chunk(0), b"xy").await.unwrap();
        let job = job_for(&session, 0);
        session.mark_closed();

        let pool = EncryptionPool::new(ChunkCipher::AesGcm, 1, 1);
        pool.submit(job).await;

        assert!(!session.is_processed(0));
    }

    #[tokio::test]
    async fn test_only_latest_attempt_is_recorded() {
        let temp_dir = TempDir::new().unwrap();
        let session = session_in(&temp_dir, 4, 4).await;

        let first = job_for(&session, 0);
        let second = job_for(&session, 0);
        tokio::fs::write(session.dirs.raw_chunk(0), b"new!").await.unwrap();

        run_job(ChunkCipher::AesGcm, first).await;
        assert!(!session.is_processed(0));
        assert_eq!(processed_entries(&session), 0);

        run_job(ChunkCipher::AesGcm, second).await;
        assert!(session.is_processed(0));

        let key = session.chunk_key(0).unwrap();
        let parsed = ProcessedChunk::parse(&std::fs::read(session.dirs.processed_chunk(0)).unwrap()).unwrap();
        assert_eq!(parsed.open(ChunkCipher::AesGcm, &key).unwrap(), b"new!");
        assert_eq!(processed_entries(&session), 1);
    }

    #[tokio::test]
    async fn test_late_job_leaves_finalized_artifact_intact() {
        let temp_dir = TempDir::new().unwrap();
        let session = session_in(&temp_dir, 2, 2).await;
        tokio::fs::write(session.dirs.raw_chunk(0), b"ab").await.unwrap();

        let generation = session.begin_upload(0).unwrap();
        run_job(ChunkCipher::AesGcm, EncryptionJob::new(Arc::clone(&session), 0, generation)).await;
        assert!(session.is_fully_processed());

        // Processed chunks accept no new attempts
        assert!(session.begin_upload(0).is_none());

        // A late job for the same attempt, racing the finalizer over a large raw chunk
        tokio::fs::write(session.dirs.raw_chunk(0), vec![9u8; 64 * 1024 * 1024]).await.unwrap();
        let late = tokio::spawn(run_job(
            ChunkCipher::AesGcm,
            EncryptionJob::new(Arc::clone(&session), 0, generation),
        ));

        let chain = assemble_key_chain(&session).await.unwrap();
        session.mark_closed();
        late.await.unwrap();

        let path = &chain.processed_files[0];
        assert!(path.exists());

        let key = session.chunk_key(0).unwrap();
        let parsed = ProcessedChunk::parse(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(parsed.next_key, Some(key));
        assert_eq!(parsed.open(ChunkCipher::AesGcm, &key).unwrap(), b"ab");
        assert_eq!(processed_entries(&session), 1);
    }
}
