//! Opaque per-file facts consumed by cross-file rules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::FileUri;

/// One file's contribution to aggregate rules.
///
/// The scheduler and caches never look inside; only the engine that produced
/// it knows the shape of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Aggregate(serde_json::Value);

impl Aggregate {
    /// Wraps an engine-defined payload.
    pub fn new(payload: serde_json::Value) -> Self {
        Self(payload)
    }

    /// Returns the engine-defined payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Aggregates keyed by file, ordered for deterministic evaluation.
pub type AggregateMap = BTreeMap<FileUri, Aggregate>;
