//! Upload Engine
//!
//! Ties the session store, chunk ingestion, encryption pool and finalizer
//! together behind the operation surface used by the HTTP layer:
//! start, upload chunk, complete, pause, resume, cancel, status, progress.
//!
//! The engine owns its background work. [`UploadEngine::start`] spawns the
//! encryption workers and the expiry sweep; [`UploadEngine::stop`] cancels
//! the sweep, interrupts grace waits and drains the encryption queue.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::UploadConfig;

use super::finalize::assemble_key_chain;
use super::ingest::persist_chunk;
use super::paths::StagingLayout;
use super::pipeline::{EncryptionJob, EncryptionPool};
use super::registrar::FileRegistrar;
use super::session::{InsertOutcome, ResumeLookup, SessionManager};
use super::types::{
    ChunkUploadResponse, FinalizedUpload, ProgressInfo, ProgressResponse, ResumeUploadResponse,
    StartUploadRequest, StartUploadResponse, UploadError, UploadSession, UploadState,
    UploadStatusResponse,
};
use super::validation::{validate_chunk_index, validate_start};

// ============================================================================
// Upload Engine
// ============================================================================

/// Resumable, chunked, encrypting upload engine
#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<UploadEngineInner>,
}

struct UploadEngineInner {
    config: UploadConfig,
    layout: StagingLayout,
    sessions: SessionManager,
    pool: EncryptionPool,

    /// Receives finished uploads
    registrar: Arc<dyn FileRegistrar>,

    /// Cancelled by `stop`; ends the sweep and interrupts grace waits
    shutdown: CancellationToken,

    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl UploadEngine {
    /// Create an engine. Nothing runs in the background until [`start`](Self::start).
    pub fn new(config: UploadConfig, registrar: Arc<dyn FileRegistrar>) -> Self {
        let layout = StagingLayout::new(&config.raw_dir, &config.processed_dir);
        let pool = EncryptionPool::new(config.cipher, config.workers, config.queue_capacity);

        Self {
            inner: Arc::new(UploadEngineInner {
                config,
                layout,
                sessions: SessionManager::new(),
                pool,
                registrar,
                shutdown: CancellationToken::new(),
                sweep_handle: Mutex::new(None),
            }),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn pool(&self) -> &EncryptionPool {
        &self.inner.pool
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create the staging roots, start the encryption workers and the expiry sweep
    pub async fn start(&self) -> Result<(), UploadError> {
        tokio::fs::create_dir_all(self.inner.layout.raw_root()).await?;
        tokio::fs::create_dir_all(self.inner.layout.processed_root()).await?;

        self.inner.pool.start();
        self.start_sweep_task();

        tracing::info!(
            raw_dir = %self.inner.layout.raw_root().display(),
            processed_dir = %self.inner.layout.processed_root().display(),
            chunk_size = self.inner.config.chunk_size,
            "Upload engine started"
        );
        Ok(())
    }

    fn start_sweep_task(&self) {
        let mut handle = self.inner.sweep_handle.lock();
        if handle.is_some() {
            return;
        }

        let engine = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.sweep_interval;

        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        engine.sweep_expired().await;
                    }
                }
            }
            tracing::debug!("Expiry sweep stopped");
        }));
    }

    /// Stop background work. Encryption jobs already queued get up to the
    /// configured drain timeout to finish.
    pub async fn stop(&self) {
        tracing::info!("Stopping upload engine...");
        self.inner.shutdown.cancel();

        let sweep = self.inner.sweep_handle.lock().take();
        if let Some(sweep) = sweep {
            let _ = sweep.await;
        }

        self.inner.pool.stop(self.inner.config.drain_timeout).await;
    }

    /// Remove every session idle for longer than the session TTL
    pub async fn sweep_expired(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.inner.config.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(super::types::SESSION_TTL_HOURS));
        let cutoff = Utc::now() - ttl;

        let mut count = 0;
        for session in self.inner.sessions.inactive_since(cutoff) {
            if let Some(session) = self.inner.sessions.remove(&session.session_id) {
                session.dirs.remove_all().await;
                tracing::debug!(
                    session_id = %session.session_id,
                    file_name = %session.file_name,
                    "Cleaned up expired session"
                );
                count += 1;
            }
        }

        if count > 0 {
            tracing::info!(count = count, "Cleaned up expired upload sessions");
        }
        count
    }

    // ========================================================================
    // Start / Resume
    // ========================================================================

    /// Start a new upload, or resume the live session for the same client, file name and size
    pub async fn start_upload(
        &self,
        request: StartUploadRequest,
    ) -> Result<StartUploadResponse, UploadError> {
        validate_start(&request, self.inner.config.max_file_size)?;

        let client_id = request
            .client_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        match self
            .inner
            .sessions
            .lookup_for_resume(&client_id, &request.file_name, request.file_size)
        {
            ResumeLookup::Resumable(session) => return Ok(self.resume_existing(&session)),
            ResumeLookup::Stale(Some(old)) => {
                tracing::warn!(
                    session_id = %old.session_id,
                    client_id = %client_id,
                    file_name = %request.file_name,
                    "Evicting stale upload session"
                );
                self.discard(&old.session_id);
            }
            ResumeLookup::Stale(None) | ResumeLookup::Absent => {}
        }

        let session_id = Uuid::new_v4().to_string();
        let dirs = self.inner.layout.session_dirs(&client_id, &session_id);
        dirs.create().await?;

        let session = Arc::new(UploadSession::new(
            session_id,
            client_id,
            &request,
            self.inner.config.chunk_size,
            dirs,
        ));

        match self.inner.sessions.insert_new(Arc::clone(&session)) {
            InsertOutcome::Inserted => Ok(StartUploadResponse {
                session_id: session.session_id.clone(),
                client_id: session.client_id.clone(),
                chunk_size: session.chunk_size,
                total_chunks: session.total_chunks,
                resumed: false,
                processed_chunks: Vec::new(),
            }),
            InsertOutcome::Raced(existing) => {
                session.dirs.remove_all().await;
                Ok(self.resume_existing(&existing))
            }
        }
    }

    fn resume_existing(&self, session: &UploadSession) -> StartUploadResponse {
        self.inner.sessions.unpause(&session.session_id);
        session.touch();

        let processed_chunks = session.processed_list();
        tracing::info!(
            session_id = %session.session_id,
            client_id = %session.client_id,
            processed = processed_chunks.len(),
            total = session.total_chunks,
            "Resuming upload session"
        );

        StartUploadResponse {
            session_id: session.session_id.clone(),
            client_id: session.client_id.clone(),
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            resumed: true,
            processed_chunks,
        }
    }

    // ========================================================================
    // Chunk Upload
    // ========================================================================

    /// Stream one chunk to staging and queue it for encryption.
    ///
    /// Returns once the raw chunk is durable; encryption finishes in the background.
    pub async fn upload_chunk<R>(
        &self,
        session_id: &str,
        chunk_index: usize,
        body: R,
    ) -> Result<ChunkUploadResponse, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let session = self.inner.sessions.require(session_id)?;
        if self.inner.sessions.is_paused(session_id) {
            return Err(UploadError::SessionPaused(session_id.to_string()));
        }
        validate_chunk_index(chunk_index, session.total_chunks)?;
        session.touch();

        let mut body = BufReader::new(body);
        if body.fill_buf().await?.is_empty() {
            return Err(UploadError::validation("chunk", "chunk body is empty"));
        }

        let Some(generation) = session.begin_upload(chunk_index) else {
            tracing::debug!(session_id = %session_id, chunk_index, "Chunk already processed, skipping");
            return Ok(chunk_response(&session, chunk_index, true));
        };

        let persisted = persist_chunk(
            &session.dirs.raw_chunk(chunk_index),
            body,
            session.chunk_size,
        )
        .await?;
        session.record_uploaded(chunk_index, persisted.digest);

        self.inner
            .pool
            .submit(EncryptionJob::new(Arc::clone(&session), chunk_index, generation))
            .await;

        self.log_progress(&session);
        Ok(chunk_response(&session, chunk_index, false))
    }

    fn log_progress(&self, session: &UploadSession) {
        let interval = chrono::Duration::from_std(self.inner.config.progress_log_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        if !session.claim_progress_log(interval) {
            return;
        }

        let progress = progress_of(session);
        tracing::info!(
            session_id = %session.session_id,
            uploaded = progress.uploaded_chunks,
            processed = progress.processed_chunks,
            total = progress.total_chunks,
            percent = progress.total_percent,
            queued = self.inner.pool.queued(),
            "Upload progress"
        );
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Finalize an upload once every chunk is encrypted.
    ///
    /// Waits one grace period for stragglers. On an I/O failure the session
    /// stays in place and the call can be retried.
    pub async fn complete_upload(&self, session_id: &str) -> Result<FinalizedUpload, UploadError> {
        let session = self.inner.sessions.require(session_id)?;
        let _finalizing = session.finalize_lock.lock().await;

        // A concurrent complete may have finished while this one waited
        if session.is_closed() {
            return Err(UploadError::SessionNotFound(session_id.to_string()));
        }
        session.touch();

        if !session.is_fully_processed() {
            tracing::debug!(
                session_id = %session_id,
                processed = session.processed_count(),
                total = session.total_chunks,
                "Waiting for encryption to catch up"
            );

            tokio::select! {
                _ = tokio::time::sleep(self.inner.config.grace_period) => {}
                _ = self.inner.shutdown.cancelled() => {
                    return Err(UploadError::Interrupted(
                        "engine shut down during completion".to_string(),
                    ));
                }
            }

            if !session.is_fully_processed() {
                let processed = session.processed_count();
                tracing::warn!(
                    session_id = %session_id,
                    processed,
                    total = session.total_chunks,
                    stalled = ?session.stalled_chunks(),
                    "Completion requested before all chunks were encrypted"
                );
                return Err(UploadError::IncompleteProcessing {
                    processed,
                    total: session.total_chunks,
                });
            }
        }

        let chain = assemble_key_chain(&session).await.map_err(|e| {
            tracing::error!(session_id = %session_id, error = %e, "Failed to assemble key chain");
            e
        })?;

        session.dirs.remove_raw().await.map_err(|e| {
            tracing::error!(session_id = %session_id, error = %e, "Failed to remove raw chunks");
            UploadError::Io(e)
        })?;

        self.inner.sessions.remove(session_id);

        let finalized = FinalizedUpload {
            session_id: session.session_id.clone(),
            client_id: session.client_id.clone(),
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            content_type: session.content_type.clone(),
            total_chunks: session.total_chunks,
            processed_files: chain.processed_files,
            chunk_digests: chain.chunk_digests,
            initial_key: chain.initial_key,
        };

        if let Err(e) = self.inner.registrar.register_pending(&finalized).await {
            tracing::error!(
                session_id = %session_id,
                file_name = %finalized.file_name,
                error = %e,
                "File registration failed"
            );
            return Err(UploadError::Handoff(e.to_string()));
        }

        tracing::info!(
            session_id = %session_id,
            client_id = %finalized.client_id,
            file_name = %finalized.file_name,
            chunks = finalized.total_chunks,
            "Completed upload"
        );

        Ok(finalized)
    }

    // ========================================================================
    // Pause / Resume / Cancel
    // ========================================================================

    /// Reject further chunk uploads until resumed. In-flight encryption continues.
    pub fn pause_upload(&self, session_id: &str) -> Result<(), UploadError> {
        let session = self.inner.sessions.require(session_id)?;
        self.inner.sessions.pause(session_id);
        session.touch();

        tracing::info!(session_id = %session_id, "Paused upload");
        Ok(())
    }

    pub fn resume_upload(&self, session_id: &str) -> Result<ResumeUploadResponse, UploadError> {
        let session = self.inner.sessions.require(session_id)?;
        self.inner.sessions.unpause(session_id);
        session.touch();

        tracing::info!(session_id = %session_id, "Resumed upload");
        Ok(ResumeUploadResponse {
            processed_chunks: session.processed_list(),
            total_chunks: session.total_chunks,
        })
    }

    /// Drop a session and delete its staging directories in the background.
    ///
    /// Returns whether the session existed.
    pub fn cancel_upload(&self, session_id: &str) -> bool {
        let found = self.discard(session_id);
        if found {
            tracing::info!(session_id = %session_id, "Cancelled upload");
        }
        found
    }

    fn discard(&self, session_id: &str) -> bool {
        match self.inner.sessions.remove(session_id) {
            Some(session) => {
                let dirs = session.dirs.clone();
                tokio::spawn(async move { dirs.remove_all().await });
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn check_status(&self, session_id: &str) -> Result<UploadStatusResponse, UploadError> {
        let session = self.inner.sessions.require(session_id)?;
        let paused = self.inner.sessions.is_paused(session_id);
        let progress = progress_of(&session);

        Ok(UploadStatusResponse {
            session_id: session.session_id.clone(),
            client_id: session.client_id.clone(),
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            created_at: session.created_at,
            last_activity_at: session.last_activity(),
            paused,
            state: UploadState::from_progress(paused, &progress),
            progress,
            processed_chunks: session.processed_list(),
            stalled_chunks: session.stalled_chunks(),
        })
    }

    /// Chunks uploaded but not encrypted, either still queued or failed
    pub fn stalled_chunks(&self, session_id: &str) -> Result<Vec<usize>, UploadError> {
        Ok(self.inner.sessions.require(session_id)?.stalled_chunks())
    }

    pub fn get_progress(&self, session_id: &str) -> Result<ProgressResponse, UploadError> {
        let session = self.inner.sessions.require(session_id)?;
        Ok(ProgressResponse {
            session_id: session.session_id.clone(),
            client_id: session.client_id.clone(),
            progress: progress_of(&session),
        })
    }
}

fn progress_of(session: &UploadSession) -> ProgressInfo {
    ProgressInfo::compute(
        session.total_chunks,
        session.uploaded_count(),
        session.processed_count(),
    )
}

fn chunk_response(session: &UploadSession, chunk_index: usize, skipped: bool) -> ChunkUploadResponse {
    ChunkUploadResponse {
        chunk_index,
        skipped,
        uploaded_chunks: session.uploaded_count(),
        processed_chunks: session.processed_count(),
        total_chunks: session.total_chunks,
    }
}

// ============================================================================
// Tests
// ============================================================================
