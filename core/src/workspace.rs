//! Workspace Manager
//!
//! Ephemeral, isolated copies of the project tree, one per verification.
//! Acquisition is capacity-bounded (disk cap / measured project size) and
//! scoped: `with_workspace` guarantees removal on every exit path,
//! including panics and cancellation, via an RAII guard. Leftover
//! directories from prior crashes are swept at startup.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ignore::WalkBuilder;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::WorkspaceConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::store::types::{FileAction, FileChange};

/// Upper bound on concurrent workspaces regardless of the disk cap
const MAX_WORKSPACE_SLOTS: u64 = 64;

/// Creates, populates, and tears down isolated per-attempt directories
pub struct WorkspaceManager {
    root: PathBuf,
    project_root: PathBuf,
    excludes: Vec<String>,
    max_file_bytes: u64,
    cleanup: bool,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

impl WorkspaceManager {
    /// Build a manager rooted at the configured workspace directory.
    ///
    /// The slot count is the disk cap divided by the measured project
    /// size, clamped to [1, 64].
    pub fn new(
        project_root: impl Into<PathBuf>,
        workspace_root: impl Into<PathBuf>,
        config: &WorkspaceConfig,
    ) -> PipelineResult<Self> {
        let project_root = project_root.into();
        let root = workspace_root.into();
        if !project_root.is_dir() {
            return Err(PipelineError::CodebaseUnreadable {
                message: format!("{} is not a directory", project_root.display()),
            });
        }
        std::fs::create_dir_all(&root)?;

        let excludes = config.copy_excludes.clone();
        let project_bytes = measure_tree(&project_root, &excludes, config.max_file_bytes);
        let slots = (config.disk_cap_bytes / project_bytes.max(1))
            .clamp(1, MAX_WORKSPACE_SLOTS) as usize;
        info!(
            root = %root.display(),
            project_bytes,
            slots,
            "Workspace manager ready"
        );

        Ok(Self {
            root,
            project_root,
            excludes,
            max_file_bytes: config.max_file_bytes,
            cleanup: config.cleanup_workspaces,
            permits: Arc::new(Semaphore::new(slots)),
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
        })
    }

    /// Remove leftover workspace directories from prior crashes.
    ///
    /// Runs before any new work is accepted.
    pub fn sweep_orphans(&self) -> PipelineResult<usize> {
        let mut removed = 0usize;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                warn!(path = %path.display(), "Removing orphan workspace");
                std::fs::remove_dir_all(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "Swept orphan workspaces");
        }
        Ok(removed)
    }

    /// Run `f` inside a freshly populated workspace for `attempt_id`.
    ///
    /// The directory is removed on every exit path: normal return, error,
    /// panic, and cancellation (dropping this future drops the guard).
    pub async fn with_workspace<F, Fut, R>(&self, attempt_id: &str, f: F) -> PipelineResult<R>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = PipelineResult<R>>,
    {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| PipelineError::WorkspaceCreationFailed {
            attempt_id: attempt_id.to_string(),
            message: format!(
                "no workspace capacity within {}s (disk cap reached)",
                self.acquire_timeout.as_secs()
            ),
        })?
        .map_err(|_| PipelineError::WorkspaceCreationFailed {
            attempt_id: attempt_id.to_string(),
            message: "workspace pool closed".into(),
        })?;

        let path = self.root.join(attempt_id);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        self.copy_project(&path).map_err(|e| match e {
            PipelineError::DiskFull { message } => PipelineError::DiskFull { message },
            other => PipelineError::WorkspaceCreationFailed {
                attempt_id: attempt_id.to_string(),
                message: other.to_string(),
            },
        })?;
        debug!(attempt_id, path = %path.display(), "Workspace populated");

        let guard = WorkspaceGuard {
            path: path.clone(),
            cleanup: self.cleanup,
            _permit: permit,
        };
        let result = f(path).await;
        drop(guard);
        result
    }

    /// Copy the project tree into `dest`, excluding VCS, build, and
    /// dependency directories (copies, never symlinks).
    fn copy_project(&self, dest: &Path) -> PipelineResult<()> {
        std::fs::create_dir_all(dest).map_err(map_space_err)?;
        let walker = build_walker(&self.project_root, &self.excludes);
        for entry in walker {
            let entry = entry.map_err(|e| PipelineError::CodebaseUnreadable {
                message: e.to_string(),
            })?;
            let src = entry.path();
            if src == self.project_root {
                continue;
            }
            let rel = src
                .strip_prefix(&self.project_root)
                .map_err(|e| PipelineError::CodebaseUnreadable {
                    message: e.to_string(),
                })?;
            let target = dest.join(rel);
            let file_type = entry.file_type();
            match file_type {
                Some(ft) if ft.is_dir() => {
                    std::fs::create_dir_all(&target).map_err(map_space_err)?;
                }
                Some(ft) if ft.is_file() => {
                    if entry
                        .metadata()
                        .map(|m| m.len() > self.max_file_bytes)
                        .unwrap_or(false)
                    {
                        continue;
                    }
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent).map_err(map_space_err)?;
                    }
                    std::fs::copy(src, &target).map_err(map_space_err)?;
                }
                // Symlinks are deliberately not reproduced
                _ => continue,
            }
        }
        Ok(())
    }
}

/// Apply FileChange records inside a workspace (non-atomic; the workspace
/// is disposable, so a partial apply just fails verification).
pub fn apply_changes(root: &Path, changes: &[FileChange]) -> PipelineResult<()> {
    for change in changes {
        let target = root.join(&change.path);
        match change.action {
            FileAction::Create | FileAction::Modify => {
                let content =
                    change
                        .content
                        .as_deref()
                        .ok_or_else(|| PipelineError::ApplyFailed {
                            path: change.path.clone(),
                            message: "missing content".into(),
                        })?;
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(map_space_err)?;
                }
                std::fs::write(&target, content).map_err(map_space_err)?;
            }
            FileAction::Delete => {
                if target.exists() {
                    std::fs::remove_file(&target)?;
                }
            }
        }
    }
    Ok(())
}

fn map_space_err(e: std::io::Error) -> PipelineError {
    if e.raw_os_error() == Some(libc_enospc()) {
        PipelineError::DiskFull {
            message: e.to_string(),
        }
    } else {
        PipelineError::Io(e)
    }
}

#[cfg(unix)]
fn libc_enospc() -> i32 {
    libc::ENOSPC
}

#[cfg(not(unix))]
fn libc_enospc() -> i32 {
    // Windows ERROR_DISK_FULL
    112
}

fn build_walker(root: &Path, excludes: &[String]) -> ignore::Walk {
    let excludes: Vec<String> = excludes.to_vec();
    WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_global(false)
        .git_exclude(false)
        .follow_links(false)
        .filter_entry(move |entry| {
            let name = entry.file_name().to_string_lossy();
            !excludes.iter().any(|ex| name == ex.as_str())
        })
        .build()
}

/// Total bytes of files the copy would include
fn measure_tree(root: &Path, excludes: &[String], max_file_bytes: u64) -> u64 {
    build_walker(root, excludes)
        .flatten()
        .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .filter_map(|e| e.metadata().ok().map(|m| m.len()))
        .filter(|len| *len <= max_file_bytes)
        .sum()
}

/// Removes the workspace directory when dropped, on every exit path
struct WorkspaceGuard {
    path: PathBuf,
    cleanup: bool,
    _permit: OwnedSemaphorePermit,
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if !self.cleanup {
            debug!(path = %self.path.display(), "Leaving workspace for inspection");
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if self.path.exists() {
                warn!(path = %self.path.display(), error = %e, "Failed to remove workspace");
            }
        }
    }
}
