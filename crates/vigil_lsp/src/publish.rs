//! Publishing cached diagnostics to the editor.
//!
//! Publications for one URI are serialized through a per-URI gate, and the
//! diagnostics are read from the cache only once the gate is held. Whichever
//! publication runs last therefore sends the latest cached state, no matter
//! which worker asked for it first.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;
use vigil_cache::FileCache;
use vigil_types::FileUri;

use crate::sink::DiagnosticsSink;

/// Sends the cached diagnostics of files to a [`DiagnosticsSink`].
pub struct Publisher {
    sink: Arc<dyn DiagnosticsSink>,
    files: Arc<FileCache>,
    gates: DashMap<FileUri, Arc<Mutex<()>>>,
}

impl Publisher {
    pub fn new(sink: Arc<dyn DiagnosticsSink>, files: Arc<FileCache>) -> Self {
        Self {
            sink,
            files,
            gates: DashMap::new(),
        }
    }

    fn gate(&self, uri: &str) -> Arc<Mutex<()>> {
        self.gates
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Publishes the current diagnostics of `uri`.
    ///
    /// Files that are not cached (deleted, renamed away or ignored) are
    /// published with an empty list.
    pub async fn publish(&self, uri: &str) {
        let gate = self.gate(uri);
        let cached = {
            let _guard = gate.lock().await;

            let state = self.files.get(uri);
            let cached = state.is_some();
            let diagnostics = state
                .map(|state| state.published_diagnostics())
                .unwrap_or_default();
            debug!("Publishing {} diagnostics for {}", diagnostics.len(), uri);
            self.sink.publish(uri, diagnostics).await;
            cached
        };
        drop(gate);

        // The final empty publication of a file retires its gate, unless
        // another publication is already waiting on it.
        if !cached {
            self.gates.remove_if(uri, |_, gate| Arc::strong_count(gate) == 1);
        }
    }

    /// Publishes the current diagnostics of every cached file.
    pub async fn publish_all(&self) {
        let mut uris = self.files.uris();
        uris.sort();
        for uri in uris {
            self.publish(&uri).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use pretty_assertions::assert_eq;
    use vigil_types::{Diagnostic, LineIndex, Span};

    #[derive(Default)]
    struct RecordingSink {
        published: SyncMutex<Vec<(String, Vec<Diagnostic>)>>,
    }

    #[tower_lsp::async_trait]
    impl DiagnosticsSink for RecordingSink {
        async fn publish(&self, uri: &str, diagnostics: Vec<Diagnostic>) {
            self.published.lock().push((uri.to_string(), diagnostics));
        }
    }

    fn diagnostic(rule: &str, text: &str) -> Diagnostic {
        Diagnostic::new(rule, "message", Span::new(0, 1), &LineIndex::new(text))
    }

    #[tokio::test]
    async fn test_publish_reads_cache() {
        let sink = Arc::new(RecordingSink::default());
        let files = Arc::new(FileCache::new());
        let publisher = Publisher::new(sink.clone(), files.clone());

        let version = files.set_contents("file:///a.rego", "package a\n");
        files.set_diagnostics(
            "file:///a.rego",
            vec![diagnostic("line-length", "package a\n")],
            Some(version),
        );

        publisher.publish("file:///a.rego").await;
        publisher.publish("file:///gone.rego").await;

        let published = sink.published.lock();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].1.len(), 1);
        assert_eq!(published[1], ("file:///gone.rego".to_string(), vec![]));
    }

    #[tokio::test]
    async fn test_gates_of_uncached_files_are_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let files = Arc::new(FileCache::new());
        let publisher = Publisher::new(sink.clone(), files.clone());

        files.set_contents("file:///a.rego", "package a\n");
        files.set_contents("file:///b.rego", "package b\n");
        publisher.publish_all().await;
        assert_eq!(publisher.gates.len(), 2);

        files.delete("file:///b.rego");
        publisher.publish("file:///b.rego").await;
        publisher.publish("file:///never-seen.rego").await;

        assert_eq!(publisher.gates.len(), 1);
        assert!(publisher.gates.contains_key("file:///a.rego"));
        assert_eq!(sink.published.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_waiting_publication_keeps_gate() {
        let sink = Arc::new(RecordingSink::default());
        let files = Arc::new(FileCache::new());
        let publisher = Publisher::new(sink, files);

        let held = publisher.gate("file:///gone.rego");
        publisher.publish("file:///gone.rego").await;
        assert!(publisher.gates.contains_key("file:///gone.rego"));

        drop(held);
        publisher.publish("file:///gone.rego").await;
        assert!(!publisher.gates.contains_key("file:///gone.rego"));
    }

    #[tokio::test]
    async fn test_parse_errors_hide_lint_diagnostics() {
        let sink = Arc::new(RecordingSink::default());
        let files = Arc::new(FileCache::new());
        let publisher = Publisher::new(sink.clone(), files.clone());

        let version = files.set_contents("file:///a.rego", "package a\n{");
        files.set_diagnostics(
            "file:///a.rego",
            vec![diagnostic("line-length", "x")],
            Some(version),
        );
        files.set_parse_errors(
            "file:///a.rego",
            vec![diagnostic("parse-error", "x")],
            Some(version),
        );

        publisher.publish_all().await;

        let published = sink.published.lock();
        assert_eq!(published.len(), 1);
        let rules: Vec<_> = published[0].1.iter().map(|d| d.rule_id.as_str()).collect();
        assert_eq!(rules, vec!["parse-error"]);
    }
}
