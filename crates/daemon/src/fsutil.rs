//! Filesystem collaborator used by the process supervisor.

use async_trait::async_trait;
use std::io;
use std::path::Path;

/// The filesystem operations the supervisor needs: existence probes,
/// recursive directory creation and deletion of partial outputs.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Probe a path, returning its metadata.
    async fn stat(&self, path: &Path) -> io::Result<std::fs::Metadata>;
    /// Create a directory and all missing parents.
    async fn mkdir_all(&self, path: &Path) -> io::Result<()>;
    /// Remove a file.
    async fn unlink(&self, path: &Path) -> io::Result<()>;
}

/// [`FileSystem`] backed by `tokio::fs`.
pub struct TokioFileSystem;

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn stat(&self, path: &Path) -> io::Result<std::fs::Metadata> {
        tokio::fs::metadata(path).await
    }

    async fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn unlink(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }
}
