//! Per-session device store files.

use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
};

use qrlink_core::traits::SessionId;
use uuid::Uuid;

const EXTENSION: &str = "db";
/// Sidecar files SQLite may leave next to a store.
const SIDECARS: [&str; 2] = ["-wal", "-shm"];

/// Directory holding one store file per session, named `<id>.db`.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    root: PathBuf,
}

impl ArtifactDir {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store path for a session.
    #[must_use]
    pub fn path_for(&self, id: SessionId) -> PathBuf {
        self.root.join(format!("{id}.{EXTENSION}"))
    }

    /// Create the directory if needed.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created.
    pub async fn ensure(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    /// Delete the store file of a session and its sidecars.
    ///
    /// Best-effort: failures are logged. Returns whether the main file was removed.
    pub async fn purge(&self, id: SessionId) -> bool {
        let path = self.path_for(id);
        let removed = match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(session_id = %id, path = %path.display(), "Session store removed");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(session_id = %id, path = %path.display(), "No session store to remove");
                false
            }
            Err(e) => {
                tracing::warn!(session_id = %id, path = %path.display(), "Failed to remove session store: {e}");
                false
            }
        };

        for suffix in SIDECARS {
            let mut sidecar = path.clone().into_os_string();
            sidecar.push(suffix);
            let sidecar = PathBuf::from(sidecar);
            match tokio::fs::remove_file(&sidecar).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    tracing::warn!(session_id = %id, path = %sidecar.display(), "Failed to remove session store sidecar: {e}");
                }
                _ => {}
            }
        }

        removed
    }

    /// Session ids that currently have a store file.
    ///
    /// # Errors
    /// Returns error if the directory cannot be read. A missing directory is empty.
    pub async fn list(&self) -> io::Result<Vec<SessionId>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Delete every store file whose id is not in `keep`.
    ///
    /// # Errors
    /// Returns error if the directory cannot be read.
    pub async fn purge_except(&self, keep: &HashSet<SessionId>) -> io::Result<usize> {
        let mut removed = 0;
        for id in self.list().await? {
            if !keep.contains(&id) && self.purge(id).await {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
