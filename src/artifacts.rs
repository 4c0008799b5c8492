//! On-disk storage for uploaded audio.
//!
//! Artifacts are written once at submission as `<job_id>.<ext>` and deleted
//! at most effectively once. Workers, the cancellation coordinator and the
//! cleanup sweeper may all race to delete the same file; [`ArtifactStore::delete_if_exists`]
//! turns every losing attempt into a no-op.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::job::JobId;

/// Handle to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(PathBuf);

impl ArtifactRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Job id encoded in the file name, if this artifact follows the
    /// `<job_id>.<ext>` layout.
    pub fn job_id(&self) -> Option<JobId> {
        self.0.file_stem()?.to_str()?.parse().ok()
    }
}

pub struct ArtifactStore {
    root: PathBuf,
    deleting: Mutex<HashSet<PathBuf>>,
}

// Clears the "deletion pending" marker however the delete ends.
struct DeletionMarker<'a> {
    set: &'a Mutex<HashSet<PathBuf>>,
    path: PathBuf,
}

impl Drop for DeletionMarker<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.path);
    }
}

impl ArtifactStore {
    /// Open (and create if needed) the artifact directory.
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            deleting: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the artifact of `job_id` lives, whether or not it was written.
    pub fn locate(&self, job_id: JobId, extension: &str) -> ArtifactRef {
        ArtifactRef(
            self.root
                .join(format!("{job_id}.{}", extension.to_ascii_lowercase())),
        )
    }

    pub async fn write(&self, artifact: &ArtifactRef, bytes: &[u8]) -> io::Result<()> {
        tokio::fs::write(artifact.path(), bytes).await?;
        debug!(path = %artifact.path().display(), bytes = bytes.len(), "artifact stored");
        Ok(())
    }

    pub async fn put(&self, job_id: JobId, extension: &str, bytes: &[u8]) -> io::Result<ArtifactRef> {
        let artifact = self.locate(job_id, extension);
        self.write(&artifact, bytes).await?;
        Ok(artifact)
    }

    pub async fn exists(&self, artifact: &ArtifactRef) -> bool {
        tokio::fs::try_exists(artifact.path()).await.unwrap_or(false)
    }

    /// Delete the artifact if it is still present.
    ///
    /// Returns `Ok(true)` if this call removed the file and `Ok(false)` if the
    /// file was already gone or another deletion of it is in flight.
    pub async fn delete_if_exists(&self, artifact: &ArtifactRef) -> io::Result<bool> {
        let path = artifact.path().to_path_buf();
        let _marker = {
            let mut set = self.deleting.lock().unwrap_or_else(|e| e.into_inner());
            if !set.insert(path.clone()) {
                debug!(path = %path.display(), "deletion already pending");
                return Ok(false);
            }
            DeletionMarker {
                set: &self.deleting,
                path: path.clone(),
            }
        };

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "artifact deleted");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "artifact delete failed");
                Err(e)
            }
        }
    }

    /// Files in the artifact directory last modified at least `age` ago.
    pub async fn scan_older_than(&self, age: Duration) -> io::Result<Vec<ArtifactRef>> {
        let now = SystemTime::now();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut stale = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                // Raced with a concurrent delete.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified()?;
            let elapsed = now.duration_since(modified).unwrap_or_default();
            if elapsed >= age {
                stale.push(ArtifactRef(entry.path()));
            }
        }

        Ok(stale)
    }
}
