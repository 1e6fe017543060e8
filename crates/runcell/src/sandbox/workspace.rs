//! Per-submission workspace lifecycle
//!
//! A workspace is an ephemeral uuid-named directory holding the staged
//! source, any expanded additional files, compile artifacts, and the stdin
//! file. It is owned by exactly one execution and removed on every terminal
//! path.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use zip::ZipArchive;

use crate::sandbox::SandboxError;

/// Name of the staged stdin file
pub const STDIN_FILE: &str = "stdin.txt";

/// An ephemeral per-submission directory
///
/// # Cleanup
///
/// Always call [`cleanup()`](Self::cleanup) explicitly on every exit path.
/// The `Drop` implementation performs best-effort synchronous removal and
/// logs a warning, but explicit cleanup is the contract.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    path: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Create a fresh workspace directory under `root`
    #[instrument(skip(root))]
    pub async fn create(root: &Path) -> Result<Self, SandboxError> {
        let id = Uuid::new_v4();
        let path = root.join(format!("runcell-{id}"));
        tokio::fs::create_dir_all(&path).await?;
        debug!(?path, "workspace created");
        Ok(Self {
            id,
            path,
            removed: false,
        })
    }

    /// Workspace identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Path of the workspace directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Host path of a file inside the workspace
    ///
    /// Returns an error if the name contains path traversal attempts.
    pub fn file_path(&self, name: &str) -> Result<PathBuf, SandboxError> {
        if name.contains("..") || name.starts_with('/') {
            return Err(SandboxError::InvalidPath(format!(
                "path traversal not allowed: {name}"
            )));
        }
        Ok(self.path.join(name))
    }

    /// Write a file into the workspace
    #[instrument(skip(self, content))]
    pub async fn write_file(&self, name: &str, content: &[u8]) -> Result<(), SandboxError> {
        let path = self.file_path(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        debug!(?path, len = content.len(), "wrote file to workspace");
        Ok(())
    }

    /// Read a file from the workspace
    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>, SandboxError> {
        let path = self.file_path(name)?;
        Ok(tokio::fs::read(&path).await?)
    }

    /// Check if a file exists in the workspace
    pub async fn file_exists(&self, name: &str) -> Result<bool, SandboxError> {
        let path = self.file_path(name)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    /// Expand a base64-encoded ZIP archive into the workspace root
    ///
    /// Returns the number of extracted files. Entries that would escape the
    /// workspace are rejected.
    #[instrument(skip(self, encoded))]
    pub async fn expand_archive(&self, encoded: &str) -> Result<usize, SandboxError> {
        let bytes = BASE64.decode(encoded)?;
        let dest = self.path.clone();
        let count = tokio::task::spawn_blocking(move || extract_zip(&dest, &bytes))
            .await
            .map_err(|e| SandboxError::Archive(e.to_string()))??;
        debug!(count, "expanded additional files archive");
        Ok(count)
    }

    /// Remove the workspace directory and everything in it
    #[must_use = "cleanup errors should be handled"]
    #[instrument(skip(self))]
    pub async fn cleanup(&mut self) -> Result<(), SandboxError> {
        if self.removed {
            return Ok(());
        }
        tokio::fs::remove_dir_all(&self.path).await?;
        self.removed = true;
        debug!(path = %self.path.display(), "workspace removed");
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.removed {
            warn!(
                workspace = %self.path.display(),
                "workspace dropped without explicit cleanup; removing best-effort"
            );
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                warn!(
                    workspace = %self.path.display(),
                    error = %e,
                    "best-effort workspace removal failed"
                );
            }
        }
    }
}

fn extract_zip(dest: &Path, bytes: &[u8]) -> Result<usize, SandboxError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| SandboxError::Archive(e.to_string()))?;

    let mut extracted = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| SandboxError::Archive(e.to_string()))?;

        // enclosed_name rejects absolute paths and traversal components
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(SandboxError::InvalidPath(format!(
                "archive entry escapes workspace: {}",
                entry.name()
            )));
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut file)?;
        extracted += 1;
    }

    Ok(extracted)
}
