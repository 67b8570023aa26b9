//! Atomic apply of an accepted survivor to the real project tree
//!
//! The single step where the pipeline mutates the project: every target
//! is written through a temporary file and renamed into place, and a
//! pre-image captured before the first write rolls back any partial
//! apply, so the tree is never left half-changed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::store::types::{FileAction, FileChange};

/// Pre-apply contents of every path a change set touches
struct PreImage {
    /// Path -> prior content; None means the path did not exist
    files: HashMap<PathBuf, Option<Vec<u8>>>,
}

impl PreImage {
    fn capture(root: &Path, changes: &[FileChange]) -> PipelineResult<Self> {
        let mut files = HashMap::new();
        for change in changes {
            let target = root.join(&change.path);
            let prior = if target.exists() {
                Some(std::fs::read(&target)?)
            } else {
                None
            };
            files.insert(target, prior);
        }
        Ok(Self { files })
    }

    /// Restore every captured path to its prior state
    fn restore(&self) {
        for (path, prior) in &self.files {
            let result = match prior {
                Some(content) => {
                    if let Some(parent) = path.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    std::fs::write(path, content)
                }
                None => {
                    if path.exists() {
                        std::fs::remove_file(path)
                    } else {
                        Ok(())
                    }
                }
            };
            if let Err(e) = result {
                error!(path = %path.display(), error = %e, "Rollback write failed");
            }
        }
    }
}

/// Apply a change set to the project tree, all-or-nothing.
///
/// On any failure mid-apply, already-applied files are restored from the
/// in-memory pre-image and the error is returned.
pub fn apply_atomically(root: &Path, changes: &[FileChange]) -> PipelineResult<()> {
    let pre_image = PreImage::capture(root, changes)?;

    for change in changes {
        if let Err(e) = apply_one(root, change) {
            warn!(path = %change.path, error = %e, "Apply failed; rolling back");
            pre_image.restore();
            return Err(PipelineError::ApplyFailed {
                path: change.path.clone(),
                message: e.to_string(),
            });
        }
    }
    info!(files = changes.len(), "Change set applied to project tree");
    Ok(())
}

fn apply_one(root: &Path, change: &FileChange) -> std::io::Result<()> {
    let target = root.join(&change.path);
    match change.action {
        FileAction::Create | FileAction::Modify => {
            let content = change.content.as_deref().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing content")
            })?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Temp-write then rename keeps readers from seeing a torn file
            let tmp = target.with_extension("manifest-tmp");
            std::fs::write(&tmp, content)?;
            std::fs::rename(&tmp, &target)?;
            Ok(())
        }
        FileAction::Delete => {
            if target.exists() {
                std::fs::remove_file(&target)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_apply_creates_modifies_deletes() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("existing.rs"), "old").unwrap();
        std::fs::write(dir.path().join("doomed.rs"), "bye").unwrap();

        apply_atomically(
            dir.path(),
            &[
                FileChange::create("new/feature.rs", "pub fn feature() {}"),
                FileChange::modify("existing.rs", "new"),
                FileChange::delete("doomed.rs"),
            ],
        )
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("new/feature.rs")).unwrap(),
            "pub fn feature() {}"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("existing.rs")).unwrap(),
            "new"
        );
        assert!(!dir.path().join("doomed.rs").exists());
    }

    #[test]
    fn test_partial_failure_rolls_back() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "original-a").unwrap();

        // The second change is malformed (modify without content), so the
        // first must be rolled back
        let bad = FileChange {
            path: "b.rs".into(),
            action: FileAction::Modify,
            content: None,
        };
        let result = apply_atomically(
            dir.path(),
            &[FileChange::modify("a.rs", "changed-a"), bad],
        );
        assert!(result.is_err());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.rs")).unwrap(),
            "original-a"
        );
        assert!(!dir.path().join("b.rs").exists());
    }

    #[test]
    fn test_rollback_removes_created_files() {
        let dir = tempdir().unwrap();
        let bad = FileChange {
            path: "z.rs".into(),
            action: FileAction::Create,
            content: None,
        };
        let result = apply_atomically(
            dir.path(),
            &[FileChange::create("made.rs", "content"), bad],
        );
        assert!(result.is_err());
        assert!(!dir.path().join("made.rs").exists());
    }
}
