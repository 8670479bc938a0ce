//! Policy file discovery.

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use crate::IgnoreMatcher;

/// Extension of policy files.
pub const POLICY_EXTENSION: &str = "rego";

/// Returns true if `path` names a policy file.
pub fn is_policy_file(path: impl AsRef<Path>) -> bool {
    path.as_ref()
        .extension()
        .is_some_and(|ext| ext == POLICY_EXTENSION)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Collects the policy files under `paths`.
///
/// Directories are walked recursively, skipping hidden entries. Files matched
/// by `ignore` are left out. The result is sorted and free of duplicates.
pub fn discover_files(paths: &[PathBuf], ignore: &IgnoreMatcher) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for root in paths {
        if root.is_file() {
            if is_policy_file(root) && !ignore.is_ignored(root) {
                files.push(root.clone());
            }
            continue;
        }

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry));
        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file() || !is_policy_file(path) {
                continue;
            }
            if ignore.is_ignored(path) {
                debug!("Ignoring {}", path.display());
                continue;
            }
            files.push(path.to_path_buf());
        }
    }

    files.sort();
    files.dedup();

    info!("Discovered {} files to lint", files.len());
    files
}
