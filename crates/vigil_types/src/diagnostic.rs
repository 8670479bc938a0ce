//! Diagnostic types for lint results.

use serde::{Deserialize, Serialize};

use crate::{LineIndex, Location, Span};

/// Severity level for diagnostics.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Error - must be fixed.
    #[default]
    Error,
    /// Warning - should be reviewed.
    Warning,
    /// Info - informational message.
    Info,
}

impl Severity {
    /// Parses a severity level as written in configuration files.
    pub fn from_level(level: &str) -> Option<Self> {
        match level {
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "info" => Some(Self::Info),
            _ => None,
        }
    }
}

/// A diagnostic message from a lint rule or from the parser.
///
/// Field order matters: the derived `Ord` sorts by rule, then message, then span,
/// which the caches rely on for stable de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The rule that generated this diagnostic.
    pub rule_id: String,

    /// Rule category (e.g. `style`, `imports`).
    pub category: String,

    /// The diagnostic message.
    pub message: String,

    /// Byte span in the source.
    pub span: Span,

    /// Editor location of `span`.
    pub loc: Location,

    /// Severity level.
    #[serde(default)]
    pub severity: Severity,

    /// Whether this diagnostic comes from a rule that needs facts from other files.
    #[serde(default)]
    pub aggregate: bool,
}

impl Diagnostic {
    /// Creates a new diagnostic, resolving the span against `index`.
    pub fn new(
        rule_id: impl Into<String>,
        message: impl Into<String>,
        span: Span,
        index: &LineIndex<'_>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            category: String::new(),
            message: message.into(),
            span,
            loc: index.location(span),
            severity: Severity::Error,
            aggregate: false,
        }
    }

    /// Sets the severity level.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the rule category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Marks the diagnostic as produced by an aggregate rule.
    pub fn with_aggregate(mut self, aggregate: bool) -> Self {
        self.aggregate = aggregate;
        self
    }

    /// Ordering used when publishing: by position first, then rule.
    pub fn sort_for_display(diagnostics: &mut [Diagnostic]) {
        diagnostics.sort_by(|a, b| {
            a.loc
                .start
                .cmp(&b.loc.start)
                .then_with(|| a.rule_id.cmp(&b.rule_id))
                .then_with(|| a.message.cmp(&b.message))
        });
    }
}
