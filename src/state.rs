//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::upload::{FileRegistrar, UploadEngine, UploadError};

/// Error type for state initialization
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Failed to start upload engine: {0}")]
    EngineStart(#[from] UploadError),
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    engine: UploadEngine,
}

impl AppState {
    /// Create the application state and start the upload engine.
    ///
    /// Fails if the staging directories cannot be created.
    pub async fn new(config: Config, registrar: Arc<dyn FileRegistrar>) -> Result<Self, StateError> {
        let engine = UploadEngine::new(config.upload.clone(), registrar);
        engine.start().await?;

        Ok(Self {
            inner: Arc::new(AppStateInner { config, engine }),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload engine
    pub fn engine(&self) -> &UploadEngine {
        &self.inner.engine
    }

    /// Stop background work and drain queued encryption
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down application state...");
        self.inner.engine.stop().await;
    }
}
