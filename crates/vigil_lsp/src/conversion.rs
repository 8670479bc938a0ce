//! LSP type conversion utilities.

use std::path::{Path, PathBuf};

use tower_lsp::lsp_types::{
    Diagnostic, DiagnosticSeverity, NumberOrString, Position, Range, Url,
};

use vigil_types::{Diagnostic as VigilDiagnostic, Severity as VigilSeverity};

/// Diagnostic source shown by editors.
pub const DIAGNOSTIC_SOURCE: &str = "vigil";

/// Converts a Vigil diagnostic to an LSP diagnostic.
pub fn to_lsp_diagnostic(diag: &VigilDiagnostic) -> Diagnostic {
    let range = Range::new(
        Position::new(diag.loc.start.line, diag.loc.start.character),
        Position::new(diag.loc.end.line, diag.loc.end.character),
    );

    let severity = match diag.severity {
        VigilSeverity::Error => DiagnosticSeverity::ERROR,
        VigilSeverity::Warning => DiagnosticSeverity::WARNING,
        VigilSeverity::Info => DiagnosticSeverity::INFORMATION,
    };

    Diagnostic {
        range,
        severity: Some(severity),
        code: Some(NumberOrString::String(diag.rule_id.clone())),
        source: Some(DIAGNOSTIC_SOURCE.to_string()),
        message: diag.message.clone(),
        ..Default::default()
    }
}

/// Returns the filesystem path of a `file://` URI.
pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    Url::parse(uri).ok()?.to_file_path().ok()
}

/// Returns the `file://` URI of an absolute path.
pub fn path_to_uri(path: &Path) -> Option<String> {
    Url::from_file_path(path).ok().map(|url| url.to_string())
}
