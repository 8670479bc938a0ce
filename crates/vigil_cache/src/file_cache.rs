//! Per-file state cache.
//!
//! Every entry is guarded by its DashMap shard, so reads and writes to
//! unrelated files do not contend. Writers additionally hold the shared side
//! of a snapshot gate; [`FileCache::all_files`] takes the exclusive side, which
//! makes the snapshot a single point in time across all entries.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;
use vigil_types::{Aggregate, Diagnostic, FileUri};

/// Cached state of one (non-ignored) file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileState {
    /// Last known text.
    pub contents: String,
    /// Version stamp of `contents`, unique across the whole cache.
    pub version: u64,
    /// Non-empty iff the file currently fails to parse.
    pub parse_errors: Vec<Diagnostic>,
    /// Lint diagnostics keyed by the rule that produced them.
    pub lint_diagnostics: BTreeMap<String, Vec<Diagnostic>>,
    /// This file's contribution to aggregate rules.
    pub aggregate: Option<Aggregate>,
}

impl FileState {
    /// Returns true if the last parse failed.
    pub fn has_parse_errors(&self) -> bool {
        !self.parse_errors.is_empty()
    }

    /// All lint diagnostics, flattened across rules.
    pub fn lint_diagnostics(&self) -> Vec<Diagnostic> {
        self.lint_diagnostics.values().flatten().cloned().collect()
    }

    /// The diagnostics an editor should see for this file.
    ///
    /// Parse errors suppress lint diagnostics until the file parses again.
    pub fn published_diagnostics(&self) -> Vec<Diagnostic> {
        let mut diagnostics = if self.has_parse_errors() {
            self.parse_errors.clone()
        } else {
            self.lint_diagnostics()
        };
        Diagnostic::sort_for_display(&mut diagnostics);
        diagnostics
    }
}

/// Thread-safe store of per-URI file state.
#[derive(Debug, Default)]
pub struct FileCache {
    files: DashMap<FileUri, FileState>,
    /// Contents of files excluded by the ignore configuration.
    ignored: DashMap<FileUri, String>,
    versions: AtomicU64,
    snapshot_gate: RwLock<()>,
}

impl FileCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The most recently issued version stamp.
    ///
    /// Any write observed after this call carries a strictly greater version.
    pub fn current_version(&self) -> u64 {
        self.versions.load(Ordering::SeqCst)
    }

    /// Returns a copy of the state of `uri`.
    pub fn get(&self, uri: &str) -> Option<FileState> {
        self.files.get(uri).map(|state| state.clone())
    }

    /// Returns the contents of `uri` together with their version.
    pub fn get_contents(&self, uri: &str) -> Option<(String, u64)> {
        self.files
            .get(uri)
            .map(|state| (state.contents.clone(), state.version))
    }

    /// Returns the current version of `uri`, if cached.
    pub fn version_of(&self, uri: &str) -> Option<u64> {
        self.files.get(uri).map(|state| state.version)
    }

    /// Returns true if `uri` is cached in the normal namespace.
    pub fn contains(&self, uri: &str) -> bool {
        self.files.contains_key(uri)
    }

    /// Number of non-ignored files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if no non-ignored file is cached.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Stores new contents and returns their version.
    ///
    /// Identical contents keep the existing version so that in-flight results
    /// computed from them stay valid.
    pub fn set_contents(&self, uri: &str, contents: impl Into<String>) -> u64 {
        let contents = contents.into();
        let _gate = self.snapshot_gate.read();

        let mut state = self.files.entry(uri.to_string()).or_default();
        if state.version != 0 && state.contents == contents {
            return state.version;
        }
        state.contents = contents;
        state.version = self.next_version();
        state.version
    }

    /// Applies `update` to the state of `uri` if its version still matches.
    ///
    /// `None` skips the version check.
    fn update_if_current(
        &self,
        uri: &str,
        expected_version: Option<u64>,
        update: impl FnOnce(&mut FileState),
    ) -> bool {
        let _gate = self.snapshot_gate.read();

        let Some(mut state) = self.files.get_mut(uri) else {
            debug!("Dropping update for uncached file {}", uri);
            return false;
        };
        if let Some(expected) = expected_version
            && state.version != expected
        {
            debug!(
                "Dropping stale update for {} (version {} != {})",
                uri, expected, state.version
            );
            return false;
        }
        update(&mut state);
        true
    }

    /// Replaces the parse errors of `uri`.
    pub fn set_parse_errors(
        &self,
        uri: &str,
        errors: Vec<Diagnostic>,
        expected_version: Option<u64>,
    ) -> bool {
        self.update_if_current(uri, expected_version, |state| {
            state.parse_errors = errors;
        })
    }

    /// Replaces the diagnostics owned by `rules`, keeping every other rule's.
    ///
    /// Diagnostics in `diagnostics` are filed under their own `rule_id`.
    pub fn set_diagnostics_for_rules(
        &self,
        uri: &str,
        rules: &[String],
        diagnostics: Vec<Diagnostic>,
        expected_version: Option<u64>,
    ) -> bool {
        self.update_if_current(uri, expected_version, |state| {
            for rule in rules {
                state.lint_diagnostics.remove(rule);
            }
            file_by_rule(&mut state.lint_diagnostics, diagnostics);
        })
    }

    /// Replaces all lint diagnostics of `uri`.
    pub fn set_diagnostics(
        &self,
        uri: &str,
        diagnostics: Vec<Diagnostic>,
        expected_version: Option<u64>,
    ) -> bool {
        self.update_if_current(uri, expected_version, |state| {
            state.lint_diagnostics.clear();
            file_by_rule(&mut state.lint_diagnostics, diagnostics);
        })
    }

    /// Replaces the aggregate contribution of `uri`.
    pub fn set_aggregate(
        &self,
        uri: &str,
        aggregate: Option<Aggregate>,
        expected_version: Option<u64>,
    ) -> bool {
        self.update_if_current(uri, expected_version, |state| {
            state.aggregate = aggregate;
        })
    }

    /// Removes `uri` from both namespaces.
    ///
    /// Returns a fresh version stamp marking the deletion, which callers use to
    /// reject results computed before it.
    pub fn delete(&self, uri: &str) -> u64 {
        let _gate = self.snapshot_gate.read();
        self.files.remove(uri);
        self.ignored.remove(uri);
        self.next_version()
    }

    /// Moves `old` to `new`, keeping its contents.
    ///
    /// Returns the version of the contents under the new URI, or `None` when
    /// `old` was not cached.
    pub fn rename(&self, old: &str, new: &str) -> Option<u64> {
        let _gate = self.snapshot_gate.read();
        let (_, state) = self.files.remove(old)?;
        let version = self.next_version();
        self.files.insert(
            new.to_string(),
            FileState {
                contents: state.contents,
                version,
                ..FileState::default()
            },
        );
        Some(version)
    }

    /// Returns a consistent snapshot of every non-ignored file.
    pub fn all_files(&self) -> HashMap<FileUri, FileState> {
        let _gate = self.snapshot_gate.write();
        self.files
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// URIs of every non-ignored file.
    pub fn uris(&self) -> Vec<FileUri> {
        let _gate = self.snapshot_gate.write();
        self.files.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Stores the contents of an ignored file.
    pub fn set_ignored_contents(&self, uri: &str, contents: impl Into<String>) {
        let _gate = self.snapshot_gate.read();
        self.ignored.insert(uri.to_string(), contents.into());
    }

    /// Returns the contents of an ignored file.
    pub fn get_ignored_contents(&self, uri: &str) -> Option<String> {
        self.ignored.get(uri).map(|c| c.clone())
    }

    /// URIs of every ignored file.
    pub fn ignored_uris(&self) -> HashSet<FileUri> {
        self.ignored.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Moves `uri` into the ignored namespace, discarding its diagnostics.
    ///
    /// Like [`FileCache::delete`], returns a fresh version stamp marking the
    /// removal, or `None` when the file was not cached.
    pub fn mark_ignored(&self, uri: &str) -> Option<u64> {
        let _gate = self.snapshot_gate.read();
        let (key, state) = self.files.remove(uri)?;
        self.ignored.insert(key, state.contents);
        Some(self.next_version())
    }

    /// Moves `uri` back into the normal namespace.
    ///
    /// Returns the version of the restored contents, or `None` when the file
    /// was not ignored.
    pub fn mark_unignored(&self, uri: &str) -> Option<u64> {
        let _gate = self.snapshot_gate.read();
        let (key, contents) = self.ignored.remove(uri)?;
        let version = self.next_version();
        self.files.insert(
            key,
            FileState {
                contents,
                version,
                ..FileState::default()
            },
        );
        Some(version)
    }
}

fn file_by_rule(target: &mut BTreeMap<String, Vec<Diagnostic>>, diagnostics: Vec<Diagnostic>) {
    for diagnostic in diagnostics {
        target
            .entry(diagnostic.rule_id.clone())
            .or_default()
            .push(diagnostic);
    }
}
