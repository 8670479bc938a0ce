//! Events accepted by the scheduler and the jobs derived from them.

use std::path::PathBuf;

use vigil_types::FileUri;

/// A change to a policy file, as reported by the editor or the file watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Opened { uri: FileUri, text: String },
    Changed { uri: FileUri, text: String },
    /// `text` is `None` when the client does not include it on save.
    Saved { uri: FileUri, text: Option<String> },
    Renamed { old: FileUri, new: FileUri },
    Deleted { uri: FileUri },
}

/// A change to the configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEvent {
    /// The file at the path was created or edited.
    Changed(PathBuf),
    /// The configuration file was removed.
    Dropped,
}

/// Lint one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLintJob {
    pub uri: FileUri,
    pub reason: &'static str,
}

/// Lint the whole workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceLintJob {
    pub reason: String,
    /// Replace the aggregate store with the result of this pass.
    pub overwrite_aggregates: bool,
    /// Only re-run aggregate rules against the current aggregate store.
    pub aggregate_report_only: bool,
}

impl WorkspaceLintJob {
    /// A full pass over every file.
    pub fn full(reason: impl Into<String>, overwrite_aggregates: bool) -> Self {
        Self {
            reason: reason.into(),
            overwrite_aggregates,
            aggregate_report_only: false,
        }
    }

    /// A pass that only re-reports aggregate rules.
    pub fn aggregate_report(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            overwrite_aggregates: false,
            aggregate_report_only: true,
        }
    }
}
