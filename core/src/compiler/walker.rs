//! Project tree enumeration for codebase analysis
//!
//! Walks the project with ignore-aware filtering, dropping binary,
//! generated, and oversized files so the analyzer only sees code the
//! AI can usefully reason about.

use std::path::Path;

use ignore::WalkBuilder;

use crate::error::{PipelineError, PipelineResult};

/// Extensions treated as binary without sniffing
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "pdf", "zip", "gz", "tar", "so", "dylib", "dll", "a",
    "o", "rlib", "wasm", "bin", "sqlite", "db",
];

/// One file the analyzer may consider
#[derive(Debug, Clone)]
pub struct ProjectFile {
    /// Project-relative path with forward slashes
    pub path: String,
    /// Size in bytes
    pub bytes: u64,
}

/// Filtered snapshot of the project tree
#[derive(Debug, Clone)]
pub struct ProjectScan {
    pub files: Vec<ProjectFile>,
}

impl ProjectScan {
    /// Enumerate `root`, excluding named directories, binary files, and
    /// files over `max_file_bytes`.
    pub fn scan(root: &Path, excludes: &[String], max_file_bytes: u64) -> PipelineResult<Self> {
        if !root.is_dir() {
            return Err(PipelineError::CodebaseUnreadable {
                message: format!("{} is not a directory", root.display()),
            });
        }
        let exclude_names: Vec<String> = excludes.to_vec();
        let walker = WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                let name = entry.file_name().to_string_lossy();
                !exclude_names.iter().any(|ex| name == ex.as_str())
            })
            .build();

        let mut files = Vec::new();
        for entry in walker {
            let entry = entry.map_err(|e| PipelineError::CodebaseUnreadable {
                message: e.to_string(),
            })?;
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            let bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if bytes > max_file_bytes {
                continue;
            }
            if is_binary(path) {
                continue;
            }
            let rel = path
                .strip_prefix(root)
                .map_err(|e| PipelineError::CodebaseUnreadable {
                    message: e.to_string(),
                })?;
            files.push(ProjectFile {
                path: rel.to_string_lossy().replace('\\', "/"),
                bytes,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Self { files })
    }

    /// Newline-separated relative paths for the analysis prompt
    pub fn tree_summary(&self) -> String {
        self.files
            .iter()
            .map(|f| f.path.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Sorted relative paths
    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

/// Extension check first, then a null-byte sniff of the head
fn is_binary(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if BINARY_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            return true;
        }
    }
    let mut head = [0u8; 1024];
    match std::fs::File::open(path).and_then(|mut f| {
        use std::io::Read;
        f.read(&mut head)
    }) {
        Ok(n) => head[..n].contains(&0),
        Err(_) => true,
    }
}

/// Where generated trees typically live; appended to configured excludes
pub fn default_analysis_excludes() -> Vec<String> {
    vec![
        ".git".into(),
        "target".into(),
        "node_modules".into(),
        "dist".into(),
        "build".into(),
        ".manifest".into(),
        "workspaces".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_scan_filters_binary_and_oversized() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn f() {}").unwrap();
        std::fs::write(dir.path().join("logo.png"), [0u8, 1, 2]).unwrap();
        std::fs::write(dir.path().join("blob.dat"), vec![0u8; 16]).unwrap();
        std::fs::write(dir.path().join("big.rs"), "x".repeat(4096)).unwrap();

        let scan = ProjectScan::scan(dir.path(), &default_analysis_excludes(), 1024).unwrap();
        let paths = scan.paths();
        assert!(paths.contains(&"src/lib.rs".to_string()));
        assert!(!paths.iter().any(|p| p.contains("logo.png")));
        assert!(!paths.iter().any(|p| p.contains("blob.dat")));
        assert!(!paths.iter().any(|p| p.contains("big.rs")));
    }

    #[test]
    fn test_scan_excludes_generated_dirs() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        std::fs::write(dir.path().join("target/debug/out.rs"), "generated").unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();

        let scan = ProjectScan::scan(dir.path(), &default_analysis_excludes(), 1024 * 1024).unwrap();
        assert_eq!(scan.paths(), vec!["main.rs".to_string()]);
    }

    #[test]
    fn test_scan_missing_root_is_unreadable() {
        let err = ProjectScan::scan(
            Path::new("/definitely/not/here"),
            &default_analysis_excludes(),
            1024,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "codebase_unreadable");
    }

    #[test]
    fn test_tree_summary_is_sorted() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.rs"), "b").unwrap();
        std::fs::write(dir.path().join("a.rs"), "a").unwrap();
        let scan = ProjectScan::scan(dir.path(), &[], 1024).unwrap();
        assert_eq!(scan.tree_summary(), "a.rs\nb.rs");
    }
}
