//! Workspace-wide aggregate snapshot.
//!
//! The store starts from one authoritative full pass ([`AggregateStore::overwrite`])
//! and is then patched per file ([`AggregateStore::merge_one`],
//! [`AggregateStore::remove`]). Every entry carries the [`FileCache`] version
//! of the contents it was computed from, so an older result can never replace
//! a newer one regardless of which worker finishes first.
//!
//! [`FileCache`]: crate::FileCache

use std::collections::{BTreeMap, HashMap};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;
use vigil_types::{Aggregate, AggregateMap, FileUri};

#[derive(Debug, Clone)]
struct VersionedAggregate {
    version: u64,
    /// `None` marks a deleted file.
    aggregate: Option<Aggregate>,
}

/// Merged aggregate facts for the whole workspace.
#[derive(Debug, Default)]
pub struct AggregateStore {
    entries: DashMap<FileUri, VersionedAggregate>,
    snapshot_gate: RwLock<()>,
}

impl AggregateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole store with the result of a full workspace pass.
    ///
    /// `as_of` is the file cache version observed when the pass read its
    /// inputs. Entries written after that point (single-file merges and
    /// deletions) survive; everything else is replaced by `snapshot`.
    pub fn overwrite(&self, snapshot: Vec<(FileUri, u64, Aggregate)>, as_of: u64) {
        let _gate = self.snapshot_gate.write();

        let newer: HashMap<FileUri, VersionedAggregate> = self
            .entries
            .iter()
            .filter(|entry| entry.value().version > as_of)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        self.entries.clear();
        for (uri, version, aggregate) in snapshot {
            if newer.contains_key(&uri) {
                continue;
            }
            self.entries.insert(
                uri,
                VersionedAggregate {
                    version,
                    aggregate: Some(aggregate),
                },
            );
        }
        for (uri, entry) in newer {
            self.entries.insert(uri, entry);
        }

        debug!("Aggregate store overwritten with {} entries", self.len());
    }

    /// Replaces the entry of one file with a newer contribution.
    ///
    /// Returns false, leaving the store untouched, when the store already
    /// holds a result computed from newer contents than `version`.
    pub fn merge_one(&self, uri: &str, version: u64, aggregate: Aggregate) -> bool {
        self.put(uri, version, Some(aggregate))
    }

    /// Drops the entry of a deleted file.
    ///
    /// The deletion is remembered at `version` so that results computed from
    /// the file's earlier contents cannot resurrect it.
    pub fn remove(&self, uri: &str, version: u64) -> bool {
        self.put(uri, version, None)
    }

    fn put(&self, uri: &str, version: u64, aggregate: Option<Aggregate>) -> bool {
        let _gate = self.snapshot_gate.read();

        let mut entry = self
            .entries
            .entry(uri.to_string())
            .or_insert(VersionedAggregate {
                version: 0,
                aggregate: None,
            });
        if entry.version > version {
            debug!(
                "Ignoring aggregate for {} at version {} (have {})",
                uri, version, entry.version
            );
            return false;
        }
        entry.version = version;
        entry.aggregate = aggregate;
        true
    }

    /// Returns the contribution of `uri`.
    pub fn get(&self, uri: &str) -> Option<Aggregate> {
        self.entries
            .get(uri)
            .and_then(|entry| entry.aggregate.clone())
    }

    /// Returns a consistent copy of every live contribution.
    pub fn snapshot(&self) -> AggregateMap {
        let _gate = self.snapshot_gate.write();
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .aggregate
                    .clone()
                    .map(|aggregate| (entry.key().clone(), aggregate))
            })
            .collect()
    }

    /// Like [`AggregateStore::snapshot`], with the version each contribution
    /// was computed from.
    pub fn versioned_snapshot(&self) -> BTreeMap<FileUri, (u64, Aggregate)> {
        let _gate = self.snapshot_gate.write();
        self.entries
            .iter()
            .filter_map(|entry| {
                let value = entry.value();
                value
                    .aggregate
                    .clone()
                    .map(|aggregate| (entry.key().clone(), (value.version, aggregate)))
            })
            .collect()
    }

    /// Number of live contributions.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().aggregate.is_some())
            .count()
    }

    /// Returns true if the store holds no live contribution.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
