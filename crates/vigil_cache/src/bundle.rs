//! Change detection for on-disk data bundles.
//!
//! A bundle is a directory holding a `.manifest` file (JSON with the data
//! namespaces the bundle owns under `roots`) and any number of `data.json`
//! files. Each refresh walks the configured roots, fingerprints the metadata of
//! those files and only re-reads bundles whose fingerprint moved.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::CacheError;

/// File name marking a bundle directory.
pub const MANIFEST_FILE: &str = ".manifest";

/// File name of bundle data documents.
pub const DATA_FILE: &str = "data.json";

#[derive(Debug, Deserialize)]
struct BundleManifest {
    #[serde(default)]
    roots: Vec<String>,
}

/// A successfully loaded bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    /// Name under which the bundle is tracked.
    pub name: String,
    /// Bundle directory.
    pub path: PathBuf,
    /// Data namespaces owned by the bundle (`a/b` style, as in the manifest).
    pub roots: Vec<String>,
    /// Merged data documents, nested by their directory inside the bundle.
    pub data: serde_json::Value,
}

#[derive(Debug, Clone)]
struct TrackedBundle {
    fingerprint: blake3::Hash,
    bundle: Bundle,
}

/// Fingerprints a set of bundle roots and reports what changed.
#[derive(Debug)]
pub struct BundleDiffCache {
    roots: Vec<PathBuf>,
    tracked: RwLock<HashMap<String, TrackedBundle>>,
}

impl BundleDiffCache {
    /// Creates a cache watching the given bundle root directories.
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            tracked: RwLock::new(HashMap::new()),
        }
    }

    /// Root directories searched for bundles.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Rescans the roots and returns the names of new or changed bundles.
    ///
    /// Bundles that disappeared are dropped from tracking. A bundle that fails
    /// to load keeps its last good state and is not reported.
    pub fn refresh(&self) -> Vec<String> {
        let discovered = self.discover();

        let mut candidates = Vec::new();
        {
            let tracked = self.tracked.read();
            for (name, dir) in &discovered {
                let fingerprint = match fingerprint(dir) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!("Failed to fingerprint bundle {}: {}", dir.display(), e);
                        continue;
                    }
                };
                let unchanged = tracked
                    .get(name)
                    .is_some_and(|t| t.fingerprint == fingerprint);
                if !unchanged {
                    candidates.push((name.clone(), dir.clone(), fingerprint));
                }
            }
        }

        let mut loaded = Vec::new();
        for (name, dir, fingerprint) in candidates {
            match load_bundle(&name, &dir) {
                Ok(bundle) => loaded.push(TrackedBundle {
                    fingerprint,
                    bundle,
                }),
                Err(e) => warn!("Keeping last good state of bundle '{}': {}", name, e),
            }
        }

        let mut tracked = self.tracked.write();
        tracked.retain(|name, _| {
            let keep = discovered.contains_key(name);
            if !keep {
                info!("Bundle '{}' removed", name);
            }
            keep
        });

        let mut changed: Vec<String> = loaded.iter().map(|t| t.bundle.name.clone()).collect();
        for entry in loaded {
            tracked.insert(entry.bundle.name.clone(), entry);
        }
        changed.sort();

        if !changed.is_empty() {
            debug!("Changed bundles: {:?}", changed);
        }
        changed
    }

    /// Names of every tracked bundle, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tracked.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the last good state of a bundle.
    pub fn get(&self, name: &str) -> Option<Bundle> {
        self.tracked.read().get(name).map(|t| t.bundle.clone())
    }

    /// Every data namespace owned by a tracked bundle, dot-separated.
    pub fn data_roots(&self) -> BTreeSet<String> {
        self.tracked
            .read()
            .values()
            .flat_map(|t| t.bundle.roots.iter())
            .map(|root| root.trim_matches('/').replace('/', "."))
            .filter(|root| !root.is_empty())
            .collect()
    }

    /// Maps bundle names to directories for every manifest under the roots.
    fn discover(&self) -> HashMap<String, PathBuf> {
        let mut found = HashMap::new();

        for root in &self.roots {
            if !root.is_dir() {
                debug!("Bundle root {} does not exist, skipping", root.display());
                continue;
            }

            for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() || entry.file_name() != MANIFEST_FILE {
                    continue;
                }
                let Some(dir) = entry.path().parent() else {
                    continue;
                };
                found.insert(bundle_name(root, dir), dir.to_path_buf());
            }
        }

        found
    }
}

fn bundle_name(root: &Path, dir: &Path) -> String {
    let relative = dir.strip_prefix(root).unwrap_or(dir);
    let name = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    if name.is_empty() {
        root.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| root.display().to_string())
    } else {
        name
    }
}

fn is_bundle_file(path: &Path) -> bool {
    matches!(
        path.file_name().and_then(|n| n.to_str()),
        Some(MANIFEST_FILE) | Some(DATA_FILE)
    )
}

/// Digest over `(relative path, size, mtime)` of every manifest and data file.
fn fingerprint(dir: &Path) -> Result<blake3::Hash, CacheError> {
    let mut files: Vec<(String, u64, u128)> = Vec::new();

    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() || !is_bundle_file(path) {
            continue;
        }
        let metadata = entry.metadata().map_err(std::io::Error::other)?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let relative = path.strip_prefix(dir).unwrap_or(path);
        files.push((relative.to_string_lossy().to_string(), metadata.len(), modified));
    }
    files.sort();

    let mut hasher = blake3::Hasher::new();
    for (path, len, modified) in &files {
        hasher.update(path.as_bytes());
        hasher.update(&len.to_le_bytes());
        hasher.update(&modified.to_le_bytes());
    }
    Ok(hasher.finalize())
}

fn load_bundle(name: &str, dir: &Path) -> Result<Bundle, CacheError> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let manifest_text = fs::read_to_string(&manifest_path)?;
    let manifest: BundleManifest = serde_json::from_str(&manifest_text)
        .map_err(|e| CacheError::invalid_bundle(&manifest_path, e.to_string()))?;

    let mut data = serde_json::Value::Object(serde_json::Map::new());
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() || entry.file_name() != DATA_FILE {
            continue;
        }
        let text = fs::read_to_string(path)?;
        let document: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| CacheError::invalid_bundle(path, e.to_string()))?;

        let segments: Vec<String> = path
            .parent()
            .and_then(|p| p.strip_prefix(dir).ok())
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        insert_at(&mut data, &segments, document);
    }

    Ok(Bundle {
        name: name.to_string(),
        path: dir.to_path_buf(),
        roots: manifest.roots,
        data,
    })
}

fn insert_at(target: &mut serde_json::Value, segments: &[String], document: serde_json::Value) {
    let Some((first, rest)) = segments.split_first() else {
        match (target, document) {
            (serde_json::Value::Object(existing), serde_json::Value::Object(incoming)) => {
                existing.extend(incoming);
            }
            (target, document) => *target = document,
        }
        return;
    };

    if !target.is_object() {
        *target = serde_json::Value::Object(serde_json::Map::new());
    }
    if let serde_json::Value::Object(map) = target {
        let child = map
            .entry(first.clone())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        insert_at(child, rest, document);
    }
}
