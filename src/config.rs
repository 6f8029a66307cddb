//! Configuration management for the Chunkvault server

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::upload::{ChunkCipher, DEFAULT_CHUNK_SIZE, MAX_FILE_SIZE, SESSION_TTL_HOURS};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Tuning for the upload engine
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Root of the raw chunk staging area
    pub raw_dir: PathBuf,

    /// Root of the processed (encrypted) chunk staging area
    pub processed_dir: PathBuf,

    pub chunk_size: u64,
    pub max_file_size: u64,

    /// Sessions idle longer than this are swept
    pub session_ttl: Duration,
    pub sweep_interval: Duration,

    /// How long `complete_upload` waits once for stragglers
    pub grace_period: Duration,

    pub workers: usize,
    pub queue_capacity: usize,

    /// Upper bound on draining the encryption queue at shutdown
    pub drain_timeout: Duration,

    pub cipher: ChunkCipher,

    /// Minimum spacing between per-session progress log lines
    pub progress_log_interval: Duration,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .max(2)
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            raw_dir: PathBuf::from("uploads"),
            processed_dir: PathBuf::from("processed"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_file_size: MAX_FILE_SIZE,
            session_ttl: Duration::from_secs(SESSION_TTL_HOURS as u64 * 3600),
            sweep_interval: Duration::from_secs(3600),
            grace_period: Duration::from_millis(3000),
            workers: default_workers(),
            queue_capacity: 2000,
            drain_timeout: Duration::from_secs(60),
            cipher: ChunkCipher::default(),
            progress_log_interval: Duration::from_millis(1000),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            upload: UploadConfig::default(),
        }
    }
}

/// Parse `var` if set, otherwise fall back to `default`
fn parse_var<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = UploadConfig::default();

        let chunk_size: u64 = parse_var("UPLOAD_CHUNK_SIZE", defaults.chunk_size)?;
        if chunk_size == 0 {
            return Err(ConfigError::Invalid {
                var: "UPLOAD_CHUNK_SIZE",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("SERVER_PORT", 3000)?,
            },
            upload: UploadConfig {
                raw_dir: env::var("UPLOAD_RAW_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.raw_dir),
                processed_dir: env::var("UPLOAD_PROCESSED_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.processed_dir),
                chunk_size,
                max_file_size: parse_var("UPLOAD_MAX_FILE_SIZE", defaults.max_file_size)?,
                session_ttl: Duration::from_secs(parse_var(
                    "UPLOAD_SESSION_TTL_SECS",
                    defaults.session_ttl.as_secs(),
                )?),
                sweep_interval: Duration::from_secs(
                    parse_var("UPLOAD_SWEEP_INTERVAL_SECS", defaults.sweep_interval.as_secs())?
                        .max(1),
                ),
                grace_period: Duration::from_millis(parse_var(
                    "UPLOAD_GRACE_PERIOD_MS",
                    defaults.grace_period.as_millis() as u64,
                )?),
                workers: parse_var("UPLOAD_WORKERS", defaults.workers)?.max(1),
                queue_capacity: parse_var("UPLOAD_QUEUE_CAPACITY", defaults.queue_capacity)?.max(1),
                drain_timeout: Duration::from_secs(parse_var(
                    "UPLOAD_DRAIN_TIMEOUT_SECS",
                    defaults.drain_timeout.as_secs(),
                )?),
                cipher: parse_var("UPLOAD_CIPHER", defaults.cipher)?,
                progress_log_interval: Duration::from_millis(parse_var(
                    "UPLOAD_PROGRESS_LOG_INTERVAL_MS",
                    defaults.progress_log_interval.as_millis() as u64,
                )?),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.upload.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.upload.session_ttl, Duration::from_secs(86_400));
        assert_eq!(config.upload.queue_capacity, 2000);
        assert!(config.upload.workers >= 2);
        assert_eq!(config.upload.cipher, ChunkCipher::AesGcm);
    }

    #[test]
    fn test_parse_var_falls_back_when_unset() {
        assert_eq!(parse_var("CHUNKVAULT_TEST_UNSET_VAR", 7u64).unwrap(), 7);
    }
}
