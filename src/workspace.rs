//! Job Workspaces
//!
//! Every job gets its own directory `<root>/<job-id>/` with `in/` and `out/`
//! subdirectories. A [`Workspace`] is released explicitly on every normal exit
//! path; if it is dropped without release (the request future was cancelled)
//! the directory is removed synchronously. Workspaces left behind by a crash
//! are removed by the orphan sweep.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use crate::operations::{INPUT_DIR, OUTPUT_DIR};

// ============================================================================
// Workspace Manager
// ============================================================================

/// Owns the workspace root directory
#[derive(Clone)]
pub struct WorkspaceManager {
    inner: Arc<WorkspaceManagerInner>,
}

struct WorkspaceManagerInner {
    root: PathBuf,
}

impl WorkspaceManager {
    /// Create the root directory if needed and resolve it to an absolute path
    pub async fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref();
        tokio::fs::create_dir_all(root).await?;
        let root = tokio::fs::canonicalize(root).await?;

        Ok(Self {
            inner: Arc::new(WorkspaceManagerInner { root }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Path a job's workspace will live at
    pub fn path_for(&self, job_id: Uuid) -> PathBuf {
        self.inner.root.join(job_id.to_string())
    }

    /// Create a fresh workspace for a job
    ///
    /// Fails if the directory already exists, so two jobs can never end up
    /// sharing one.
    pub async fn create(&self, job_id: Uuid) -> std::io::Result<Workspace> {
        let path = self.path_for(job_id);
        tokio::fs::create_dir(&path).await?;

        // From here on the guard owns the directory
        let workspace = Workspace {
            job_id,
            path,
            released: false,
        };

        tokio::fs::create_dir(workspace.path.join(INPUT_DIR)).await?;
        tokio::fs::create_dir(workspace.path.join(OUTPUT_DIR)).await?;

        tracing::debug!(job_id = %job_id, path = %workspace.path.display(), "Created workspace");

        Ok(workspace)
    }

    /// Remove job directories whose last modification is older than `grace`
    ///
    /// Only directories named like a job ID are touched. Returns the number
    /// of workspaces removed.
    pub async fn sweep_orphans(&self, grace: Duration) -> std::io::Result<usize> {
        let mut removed = 0;
        let now = SystemTime::now();
        let mut entries = tokio::fs::read_dir(&self.inner.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if Uuid::parse_str(name).is_err() {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(m) if m.is_dir() => m,
                _ => continue,
            };

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();

            if age < grace {
                continue;
            }

            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    removed += 1;
                    tracing::info!(
                        workspace = %name,
                        age_secs = age.as_secs(),
                        "Removed orphaned workspace"
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(workspace = %name, error = %e, "Failed to remove orphaned workspace");
                }
            }
        }

        Ok(removed)
    }

    /// Start background orphan sweep
    pub fn start_sweep_task(self, interval: Duration, grace: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The startup sweep already ran
            ticker.tick().await;

            loop {
                ticker.tick().await;
                match self.sweep_orphans(grace).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(removed = n, "Orphan sweep complete"),
                    Err(e) => tracing::warn!(error = %e, "Orphan sweep failed"),
                }
            }
        })
    }
}

// ============================================================================
// Workspace
// ============================================================================

/// Exclusively owned directory for one job
#[derive(Debug)]
pub struct Workspace {
    job_id: Uuid,
    path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Absolute workspace directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a workspace-relative path
    pub fn resolve(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.path.join(relative)
    }

    /// Write an uploaded file to `in/<name>`, returning its relative path
    pub async fn write_input(&self, name: &str, data: &[u8]) -> std::io::Result<PathBuf> {
        let relative = Path::new(INPUT_DIR).join(name);
        tokio::fs::write(self.path.join(&relative), data).await?;
        Ok(relative)
    }

    /// Delete the workspace directory
    pub async fn release(mut self) -> std::io::Result<()> {
        self.released = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                tracing::debug!(job_id = %self.job_id, "Released workspace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Failed to release workspace");
                Err(e)
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {
                tracing::debug!(job_id = %self.job_id, "Workspace removed on drop");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Failed to remove workspace on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_and_release() {
        let temp_dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp_dir.path()).await.unwrap();

        let workspace = manager.create(Uuid::new_v4()).await.unwrap();
        let path = workspace.path().to_path_buf();
        assert!(path.join("in").is_dir());
        assert!(path.join("out").is_dir());

        let input = workspace.write_input("input-1.pdf", b"%PDF-1.4").await.unwrap();
        assert_eq!(input, PathBuf::from("in/input-1.pdf"));
        assert!(workspace.resolve(&input).is_file());

        workspace.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_drop_removes_directory() {
        let temp_dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp_dir.path()).await.unwrap();

        let workspace = manager.create(Uuid::new_v4()).await.unwrap();
        let path = workspace.path().to_path_buf();
        drop(workspace);

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_create_refuses_existing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp_dir.path()).await.unwrap();

        let id = Uuid::new_v4();
        let _first = manager.create(id).await.unwrap();
        let second = manager.create(id).await;
        assert_eq!(
            second.unwrap_err().kind(),
            std::io::ErrorKind::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_sweep_orphans() {
        let temp_dir = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp_dir.path()).await.unwrap();

        // Simulate a crash: directory exists, guard is gone
        let orphan = manager.path_for(Uuid::new_v4());
        std::fs::create_dir_all(orphan.join("in")).unwrap();

        // Unrelated directories are never touched
        let unrelated = temp_dir.path().join("keep-me");
        std::fs::create_dir(&unrelated).unwrap();

        let removed = manager.sweep_orphans(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 0);
        assert!(orphan.exists());

        let removed = manager.sweep_orphans(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!orphan.exists());
        assert!(unrelated.exists());
    }
}
