//! File registration hand-off
//!
//! A finished upload is announced to a [`FileRegistrar`], which records a
//! pending file entry. What happens to the file afterwards is the
//! registrar's business.

use parking_lot::Mutex;

use super::types::FinalizedUpload;

/// Registration failure reported by a [`FileRegistrar`]
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct RegistrarError(pub String);

// ============================================================================
// Registrar Trait
// ============================================================================

/// Receives every upload that completed finalization
#[async_trait::async_trait]
pub trait FileRegistrar: Send + Sync {
    /// Create a pending file record for `upload`
    async fn register_pending(&self, upload: &FinalizedUpload) -> Result<(), RegistrarError>;
}

/// Registrar that only logs the hand-off
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingRegistrar;

#[async_trait::async_trait]
impl FileRegistrar for LoggingRegistrar {
    async fn register_pending(&self, upload: &FinalizedUpload) -> Result<(), RegistrarError> {
        tracing::info!(
            session_id = %upload.session_id,
            client_id = %upload.client_id,
            file_name = %upload.file_name,
            chunks = upload.total_chunks,
            "Registered pending file"
        );
        Ok(())
    }
}

/// Registrar that keeps hand-offs in memory
#[derive(Debug, Default)]
pub struct MemoryRegistrar {
    registered: Mutex<Vec<FinalizedUpload>>,
    fail_with: Mutex<Option<String>>,
}

impl MemoryRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following registration fail with `reason`
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.fail_with.lock() = Some(reason.into());
    }

    pub fn registered(&self) -> Vec<FinalizedUpload> {
        self.registered.lock().clone()
    }
}

#[async_trait::async_trait]
impl FileRegistrar for MemoryRegistrar {
    async fn register_pending(&self, upload: &FinalizedUpload) -> Result<(), RegistrarError> {
        if let Some(reason) = self.fail_with.lock().clone() {
            return Err(RegistrarError(reason));
        }
        self.registered.lock().push(upload.clone());
        Ok(())
    }
}
