//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - No sleep() calls in production code (the sequence clock is ticked, never slept)
//! - No unwrap()/expect() in production code (every error is a result value)
//! - The core crate stays transport-free
//!
//! These tests are designed to catch violations early in the development cycle.

use std::fs;
use std::path::{Path, PathBuf};

/// Workspace root (two levels above this package)
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../.."))
}

/// Production source directories of the workspace crates
#[must_use]
pub fn production_dirs() -> Vec<PathBuf> {
    let root = workspace_root();
    vec![root.join("sith/core/src"), root.join("sith/daemon/src")]
}

/// Every `.rs` file under `dir`
#[must_use]
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(walkdir::DirEntry::into_path)
        .collect();
    files.sort();
    files
}

/// Numbered code lines of `path` outside the trailing `#[cfg(test)]` module,
/// with `//` comments stripped
#[must_use]
pub fn production_lines(path: &Path) -> Vec<(usize, String)> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .map(|(idx, line)| {
            let code = line.split("//").next().unwrap_or(line);
            (idx + 1, code.to_string())
        })
        .filter(|(_, code)| !code.trim().is_empty())
        .collect()
}

/// `file:line - code` for every production line matching `pred`
pub fn violations(dirs: &[PathBuf], pred: impl Fn(&str) -> bool) -> Vec<String> {
    let mut found = Vec::new();
    for dir in dirs {
        for file in rust_files(dir) {
            for (line_number, code) in production_lines(&file) {
                if pred(&code) {
                    found.push(format!("{}:{} - {}", file.display(), line_number, code.trim()));
                }
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_sources_are_found() {
        for dir in production_dirs() {
            assert!(dir.exists(), "{} missing", dir.display());
            assert!(!rust_files(&dir).is_empty());
        }
    }

    #[test]
    fn test_test_module_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.rs");
        fs::write(
            &path,
            "fn a() {}\n// note\nfn b() { x.unwrap() } // trailing\n#[cfg(test)]\nmod tests {}\n",
        )
        .unwrap();

        let lines = production_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].0, 3);
        assert!(lines[1].1.contains("unwrap"));
        assert!(!lines[1].1.contains("trailing"));
    }
}
