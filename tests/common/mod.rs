//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chunkvault_server::config::UploadConfig;
use chunkvault_server::upload::{MemoryRegistrar, StartUploadRequest, UploadEngine};
use tempfile::TempDir;

/// A running engine on throwaway staging directories.
pub struct TestEngine {
    pub engine: UploadEngine,
    pub registrar: Arc<MemoryRegistrar>,
    pub config: UploadConfig,
    _temp_dir: TempDir,
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut UploadConfig)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = UploadConfig {
            raw_dir: temp_dir.path().join("uploads"),
            processed_dir: temp_dir.path().join("processed"),
            chunk_size: 5,
            grace_period: Duration::from_millis(200),
            workers: 2,
            queue_capacity: 16,
            drain_timeout: Duration::from_secs(5),
            ..UploadConfig::default()
        };
        configure(&mut config);

        let registrar = Arc::new(MemoryRegistrar::new());
        let engine = UploadEngine::new(config.clone(), registrar.clone());
        engine.start().await.expect("Failed to start engine");

        Self {
            engine,
            registrar,
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Poll until `count` chunks of the session are processed.
    pub async fn wait_processed(&self, session_id: &str, count: usize) {
        for _ in 0..300 {
            let status = self
                .engine
                .check_status(session_id)
                .expect("session should exist");
            if status.progress.processed_chunks >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} processed chunks", count);
    }
}

pub fn start_request(file_name: &str, file_size: u64, client_id: Option<&str>) -> StartUploadRequest {
    StartUploadRequest {
        file_name: file_name.to_string(),
        file_size,
        content_type: "text/plain".to_string(),
        client_id: client_id.map(str::to_string),
    }
}

/// Deterministic file contents split into `chunk_size` pieces.
pub fn test_file(size: usize, chunk_size: usize) -> (Vec<u8>, Vec<Vec<u8>>) {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let chunks = data.chunks(chunk_size).map(<[u8]>::to_vec).collect();
    (data, chunks)
}

/// Poll until `path` no longer exists.
pub async fn wait_removed(path: &std::path::Path) {
    for _ in 0..300 {
        if !path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} was not removed", path.display());
}
