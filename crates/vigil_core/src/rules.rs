//! Built-in rule implementations.

use std::collections::{BTreeMap, BTreeSet};

use vigil_types::{Diagnostic, FileUri, LineIndex, Span};

use crate::catalog::EnabledRule;
use crate::engine::{ModuleFacts, SourceFile};

pub(crate) const LINE_LENGTH: &str = "line-length";
pub(crate) const TRAILING_WHITESPACE: &str = "trailing-whitespace";
pub(crate) const TODO_COMMENT: &str = "todo-comment";
pub(crate) const UNRESOLVED_IMPORT: &str = "unresolved-import";

/// Rules this engine can evaluate.
pub(crate) const BUILTIN_RULES: &[&str] =
    &[LINE_LENGTH, TRAILING_WHITESPACE, TODO_COMMENT, UNRESOLVED_IMPORT];

const DEFAULT_MAX_LINE_LENGTH: usize = 120;

/// Runs a single-file rule.
pub(crate) fn check_file(rule: &EnabledRule, file: &SourceFile) -> Vec<Diagnostic> {
    let index = LineIndex::new(&file.contents);
    let diagnostics = match rule.name.as_str() {
        LINE_LENGTH => line_length(rule, file, &index),
        TRAILING_WHITESPACE => trailing_whitespace(file, &index),
        TODO_COMMENT => todo_comment(rule, file, &index),
        _ => Vec::new(),
    };

    diagnostics
        .into_iter()
        .map(|d| {
            d.with_category(rule.category.clone())
                .with_severity(rule.severity)
        })
        .collect()
}

fn lines(contents: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    contents.split_inclusive('\n').map(move |raw| {
        let start = offset;
        offset += raw.len();
        (start, raw.trim_end_matches(['\n', '\r']))
    })
}

fn line_length(rule: &EnabledRule, file: &SourceFile, index: &LineIndex<'_>) -> Vec<Diagnostic> {
    let max = rule
        .options
        .get("max")
        .and_then(|v| v.as_u64())
        .map_or(DEFAULT_MAX_LINE_LENGTH, |v| v as usize);

    lines(&file.contents)
        .filter_map(|(start, line)| {
            let length = line.chars().count();
            if length <= max {
                return None;
            }
            let overflow = line.char_indices().nth(max).map_or(0, |(i, _)| i);
            let span = Span::new((start + overflow) as u32, (start + line.len()) as u32);
            Some(Diagnostic::new(
                LINE_LENGTH,
                format!("Line is {} characters long, exceeding the limit of {}", length, max),
                span,
                index,
            ))
        })
        .collect()
}

fn trailing_whitespace(file: &SourceFile, index: &LineIndex<'_>) -> Vec<Diagnostic> {
    lines(&file.contents)
        .filter_map(|(start, line)| {
            let trimmed = line.trim_end_matches([' ', '\t']);
            if trimmed.len() == line.len() {
                return None;
            }
            let span = Span::new((start + trimmed.len()) as u32, (start + line.len()) as u32);
            Some(Diagnostic::new(
                TRAILING_WHITESPACE,
                "Line ends with whitespace",
                span,
                index,
            ))
        })
        .collect()
}

fn todo_comment(rule: &EnabledRule, file: &SourceFile, index: &LineIndex<'_>) -> Vec<Diagnostic> {
    let keywords: Vec<&str> = rule
        .options
        .get("keywords")
        .and_then(|v| v.as_array())
        .map(|values| values.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    file.module
        .comments
        .iter()
        .filter_map(|span| {
            let text = &file.contents[span.start as usize..span.end as usize];
            let keyword = keywords.iter().find(|keyword| text.contains(*keyword))?;
            Some(Diagnostic::new(
                TODO_COMMENT,
                format!("Comment contains `{}`", keyword),
                *span,
                index,
            ))
        })
        .collect()
}

/// Decides whether an import path refers to something that exists.
#[derive(Debug, Default)]
pub(crate) struct ImportResolver {
    /// Packages and bundle roots, relative to `data`.
    documents: BTreeSet<String>,
    /// Prefixes that always resolve.
    builtin: Vec<String>,
}

impl ImportResolver {
    pub(crate) fn new(
        packages: impl IntoIterator<Item = String>,
        data_roots: &BTreeSet<String>,
        builtin: Vec<String>,
    ) -> Self {
        let mut documents: BTreeSet<String> = packages.into_iter().collect();
        documents.extend(data_roots.iter().cloned());
        Self { documents, builtin }
    }

    pub(crate) fn resolves(&self, path: &str) -> bool {
        if self.builtin.iter().any(|prefix| has_prefix(path, prefix)) {
            return true;
        }
        let Some(rest) = path.strip_prefix("data.") else {
            // `data` itself, or a root this engine does not check.
            return true;
        };
        self.documents
            .iter()
            .any(|document| has_prefix(rest, document) || has_prefix(document, rest))
    }
}

/// Returns true if `path` equals `prefix` or continues it with a `.` segment.
fn has_prefix(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}

/// Runs an aggregate rule over the facts of every module.
pub(crate) fn check_workspace(
    rule: &EnabledRule,
    modules: &BTreeMap<FileUri, ModuleFacts>,
    resolver: &ImportResolver,
) -> BTreeMap<FileUri, Vec<Diagnostic>> {
    match rule.name.as_str() {
        UNRESOLVED_IMPORT => unresolved_import(rule, modules, resolver),
        _ => BTreeMap::new(),
    }
}

fn unresolved_import(
    rule: &EnabledRule,
    modules: &BTreeMap<FileUri, ModuleFacts>,
    resolver: &ImportResolver,
) -> BTreeMap<FileUri, Vec<Diagnostic>> {
    let except: Vec<&str> = rule
        .options
        .get("except")
        .and_then(|v| v.as_array())
        .map(|values| values.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();

    modules
        .iter()
        .map(|(uri, facts)| {
            let diagnostics = facts
                .imports
                .iter()
                .filter(|import| !except.iter().any(|prefix| has_prefix(&import.path, prefix)))
                .filter(|import| !resolver.resolves(&import.path))
                .map(|import| Diagnostic {
                    rule_id: UNRESOLVED_IMPORT.to_string(),
                    category: rule.category.clone(),
                    message: format!("Unresolved import `{}`", import.path),
                    span: import.span,
                    loc: import.loc,
                    severity: rule.severity,
                    aggregate: true,
                })
                .collect();
            (uri.clone(), diagnostics)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Parser, RegoParser};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use vigil_types::{Position, Severity};

    fn rule(name: &str, options: serde_json::Value) -> EnabledRule {
        EnabledRule {
            name: name.to_string(),
            category: "style".to_string(),
            severity: Severity::Warning,
            aggregate: name == UNRESOLVED_IMPORT,
            options,
        }
    }

    fn source(contents: &str) -> SourceFile {
        let module = RegoParser::new().parse("file:///t.rego", contents).unwrap();
        SourceFile {
            contents: contents.to_string(),
            module,
        }
    }

    #[test]
    fn test_line_length() {
        let file = source("package foo\nallow := \"abcdefghij\"\n");
        let diagnostics = check_file(&rule(LINE_LENGTH, serde_json::json!({"max": 12})), &file);

        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].loc.start, Position::new(1, 12));
        assert_eq!(diagnostics[0].severity, Severity::Warning);
        assert_eq!(diagnostics[0].category, "style");
    }

    #[test]
    fn test_line_length_default_limit() {
        let file = source(&format!("package foo\nx := \"{}\"\n", "a".repeat(200)));
        let diagnostics = check_file(&rule(LINE_LENGTH, serde_json::json!({})), &file);
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn test_trailing_whitespace() {
        let file = source("package foo  \r\nallow := true\t\nx := 1\n");
        let diagnostics = check_file(&rule(TRAILING_WHITESPACE, serde_json::Value::Null), &file);

        let lines: Vec<u32> = diagnostics.iter().map(|d| d.loc.start.line).collect();
        assert_eq!(lines, vec![0, 1]);
        assert_eq!(diagnostics[0].loc.start, Position::new(0, 11));
    }

    #[test]
    fn test_todo_comment_only_in_comments() {
        let file = source("package foo\n# TODO: tighten\nmsg := \"TODO in string\"\n");
        let options = serde_json::json!({"keywords": ["TODO", "FIXME"]});
        let diagnostics = check_file(&rule(TODO_COMMENT, options), &file);

        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].message, "Comment contains `TODO`");
        assert_eq!(diagnostics[0].loc.start.line, 1);
    }

    #[rstest]
    #[case("data.bar", true)]
    #[case("data.bar.allow", true)]
    #[case("data.authz", true)]
    #[case("data.users.admins", true)]
    #[case("data.baz", false)]
    #[case("data.barn", false)]
    #[case("input.request", true)]
    #[case("future.keywords.if", true)]
    #[case("rego.v1", true)]
    fn test_import_resolver(#[case] path: &str, #[case] resolved: bool) {
        let roots = BTreeSet::from(["users".to_string()]);
        let resolver = ImportResolver::new(
            ["bar".to_string(), "authz.rules".to_string()],
            &roots,
            vec!["input".into(), "future.keywords".into(), "rego.v1".into()],
        );
        assert_eq!(resolver.resolves(path), resolved);
    }

    #[test]
    fn test_unresolved_import_respects_except() {
        let file = source("package foo\nimport data.bar\nimport data.vendor.x\n");
        let modules = BTreeMap::from([(
            "file:///foo.rego".to_string(),
            ModuleFacts::from_module(&file.module),
        )]);
        let resolver = ImportResolver::default();
        let options = serde_json::json!({"except": ["data.vendor"]});

        let result = check_workspace(&rule(UNRESOLVED_IMPORT, options), &modules, &resolver);
        let diagnostics = &result["file:///foo.rego"];

        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].message, "Unresolved import `data.bar`");
        assert!(diagnostics[0].aggregate);
        assert_eq!(diagnostics[0].loc.start, Position::new(1, 7));
    }
}
