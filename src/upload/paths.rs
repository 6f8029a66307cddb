//! Staging Layout
//!
//! Derives per-session staging directories:
//!
//! ```text
//! <raw-root>/<client>/<session>/chunk_<n>
//! <processed-root>/<client>/<session>/encrypted_chunk_<n>
//! ```
//!
//! Path components are reduced to `[A-Za-z0-9_-]` and length-capped, so a
//! client id can never climb out of its root.

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Longest path component kept after sanitizing
pub const MAX_COMPONENT_LEN: usize = 64;

/// Roots of the raw and processed staging areas
#[derive(Debug, Clone)]
pub struct StagingLayout {
    raw_root: PathBuf,
    processed_root: PathBuf,
}

impl StagingLayout {
    pub fn new(raw_root: impl Into<PathBuf>, processed_root: impl Into<PathBuf>) -> Self {
        Self {
            raw_root: raw_root.into(),
            processed_root: processed_root.into(),
        }
    }

    pub fn raw_root(&self) -> &Path {
        &self.raw_root
    }

    pub fn processed_root(&self) -> &Path {
        &self.processed_root
    }

    /// Resolve the staging directories of one session
    pub fn session_dirs(&self, client_id: &str, session_id: &str) -> SessionDirs {
        let client = sanitize_component(client_id);
        let session = sanitize_component(session_id);

        SessionDirs {
            raw: self.raw_root.join(&client).join(&session),
            processed: self.processed_root.join(&client).join(&session),
        }
    }
}

/// Raw and processed directories of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDirs {
    pub raw: PathBuf,
    pub processed: PathBuf,
}

impl SessionDirs {
    pub fn raw_chunk(&self, index: usize) -> PathBuf {
        self.raw.join(format!("chunk_{}", index))
    }

    pub fn processed_chunk(&self, index: usize) -> PathBuf {
        self.processed.join(format!("encrypted_chunk_{}", index))
    }

    /// Create both directories; on failure nothing created here is left behind
    pub async fn create(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.raw).await?;
        if let Err(e) = tokio::fs::create_dir_all(&self.processed).await {
            let _ = remove_session_dir(&self.raw).await;
            return Err(e);
        }
        Ok(())
    }

    /// Remove the raw directory and its contents. Missing is fine.
    pub async fn remove_raw(&self) -> std::io::Result<()> {
        remove_session_dir(&self.raw).await
    }

    /// Best-effort removal of both directories; failures are logged
    pub async fn remove_all(&self) {
        for dir in [&self.raw, &self.processed] {
            if let Err(e) = remove_session_dir(dir).await {
                tracing::error!(dir = %dir.display(), error = %e, "Failed to remove staging directory");
            }
        }
    }
}

async fn remove_session_dir(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(dir = %dir.display(), "Removed staging directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    // Drop the client directory too once its last session is gone
    if let Some(parent) = dir.parent() {
        let _ = tokio::fs::remove_dir(parent).await;
    }
    Ok(())
}

/// A unique file next to `path` to write into before renaming over `path`
pub fn staging_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.part", name, Uuid::new_v4().simple()))
}

/// Reduce a caller-supplied identifier to a safe single path component
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(MAX_COMPONENT_LEN)
        .collect();

    if cleaned.is_empty() {
        Uuid::new_v4().simple().to_string()
    } else {
        cleaned
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_keeps_safe_characters() {
        assert_eq!(sanitize_component("client_01-AB"), "client_01-AB");
    }

    #[test]
    fn test_sanitize_strips_traversal() {
        assert_eq!(sanitize_component("../../etc/passwd"), "etcpasswd");
    }

    #[test]
    fn test_sanitize_caps_length() {
        let long = "a".repeat(200);
        assert_eq!(sanitize_component(&long).len(), MAX_COMPONENT_LEN);
    }

    #[test]
    fn test_sanitize_replaces_empty_with_token() {
        let token = sanitize_component("../..");
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, sanitize_component("../.."));
    }

    #[test]
    fn test_session_dirs_layout() {
        let layout = StagingLayout::new("/srv/uploads", "/srv/processed");
        let dirs = layout.session_dirs("client/1", "abc");

        assert_eq!(dirs.raw, PathBuf::from("/srv/uploads/client1/abc"));
        assert_eq!(dirs.processed, PathBuf::from("/srv/processed/client1/abc"));
        assert_eq!(dirs.raw_chunk(3), PathBuf::from("/srv/uploads/client1/abc/chunk_3"));
        assert_eq!(
            dirs.processed_chunk(0),
            PathBuf::from("/srv/processed/client1/abc/encrypted_chunk_0")
        );
    }

    #[test]
    fn test_staging_sibling_stays_in_directory() {
        let path = PathBuf::from("/srv/uploads/c/s/chunk_2");
        let first = staging_sibling(&path);
        let second = staging_sibling(&path);

        assert_eq!(first.parent(), path.parent());
        assert!(first.file_name().unwrap().to_string_lossy().starts_with(".chunk_2."));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_create_and_remove() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StagingLayout::new(temp_dir.path().join("raw"), temp_dir.path().join("out"));
        let dirs = layout.session_dirs("c", "s");

        dirs.create().await.unwrap();
        assert!(dirs.raw.is_dir());
        assert!(dirs.processed.is_dir());

        tokio::fs::write(dirs.raw_chunk(0), b"x").await.unwrap();
        dirs.remove_all().await;

        assert!(!dirs.raw.exists());
        assert!(!dirs.processed.exists());
        // Empty client directories are pruned as well
        assert!(!temp_dir.path().join("raw").join("c").exists());
    }
}
