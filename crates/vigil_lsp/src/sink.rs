//! Where published diagnostics go.

use tower_lsp::Client;
use tower_lsp::lsp_types::Url;
use tracing::warn;
use vigil_types::Diagnostic;

use crate::conversion::to_lsp_diagnostic;

/// Receives the full diagnostic list of a file each time it is published.
///
/// An empty list clears the file in the editor.
#[tower_lsp::async_trait]
pub trait DiagnosticsSink: Send + Sync {
    async fn publish(&self, uri: &str, diagnostics: Vec<Diagnostic>);
}

#[tower_lsp::async_trait]
impl DiagnosticsSink for Client {
    async fn publish(&self, uri: &str, diagnostics: Vec<Diagnostic>) {
        let url = match Url::parse(uri) {
            Ok(url) => url,
            Err(e) => {
                warn!("Cannot publish diagnostics for invalid URI {}: {}", uri, e);
                return;
            }
        };
        let diagnostics = diagnostics.iter().map(to_lsp_diagnostic).collect();
        self.publish_diagnostics(url, diagnostics, None).await;
    }
}
