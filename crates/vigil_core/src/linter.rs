//! One-shot linting of files on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};
use vigil_cache::BundleDiffCache;
use vigil_types::{Diagnostic, FileUri, Severity};

use crate::engine::{EvalRequest, Evaluator, SourceFile};
use crate::parser::Parser;
use crate::walker::discover_files;
use crate::{LinterConfig, LinterError};

/// Lint result for a single file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LintResult {
    /// Path to the linted file.
    pub path: PathBuf,

    /// Diagnostics found in the file.
    pub diagnostics: Vec<Diagnostic>,
}

impl LintResult {
    /// Creates a new lint result.
    pub fn new(path: PathBuf, diagnostics: Vec<Diagnostic>) -> Self {
        Self { path, diagnostics }
    }

    /// Returns true if any diagnostic is an error.
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }
}

/// Lints every policy file under `paths` in one full pass.
///
/// Unreadable files are logged and skipped. Files that fail to parse are
/// reported with their parse errors and take no part in aggregate rules.
pub fn lint_paths(
    evaluator: &dyn Evaluator,
    parser: &dyn Parser,
    config: &LinterConfig,
    paths: &[PathBuf],
) -> Result<Vec<LintResult>, LinterError> {
    let ignore = config.ignore_matcher()?;
    let files = discover_files(paths, &ignore);

    let bundles = BundleDiffCache::new(config.bundle_roots());
    bundles.refresh();

    let parsed: Vec<(PathBuf, Result<SourceFile, Vec<Diagnostic>>)> = files
        .into_par_iter()
        .filter_map(|path| {
            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(e) => {
                    warn!("Failed to read {}: {}", path.display(), e);
                    return None;
                }
            };
            let uri = path.display().to_string();
            let result = parser
                .parse(&uri, &contents)
                .map(|module| SourceFile { contents, module });
            Some((path, result))
        })
        .collect();

    let mut results = Vec::new();
    let mut sources: BTreeMap<FileUri, SourceFile> = BTreeMap::new();
    let mut paths_by_uri: BTreeMap<FileUri, PathBuf> = BTreeMap::new();
    for (path, result) in parsed {
        match result {
            Ok(source) => {
                let uri = path.display().to_string();
                sources.insert(uri.clone(), source);
                paths_by_uri.insert(uri, path);
            }
            Err(errors) => results.push(LintResult::new(path, errors)),
        }
    }

    let request = EvalRequest {
        files: sources,
        enabled_rules: evaluator.enabled_rules(config),
        prior_aggregates: None,
        data_roots: bundles.data_roots(),
    };
    let output = evaluator.evaluate(&request)?;
    for notice in &output.notices {
        warn!("{}", notice);
    }

    for (uri, diagnostics) in output.violations {
        if let Some(path) = paths_by_uri.remove(&uri) {
            results.push(LintResult::new(path, diagnostics));
        }
    }
    results.sort_by(|a, b| a.path.cmp(&b.path));

    info!("Linted {} files", results.len());
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, EngineOptions};
    use crate::parser::RegoParser;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(temp: &TempDir, relative: &str, contents: &str) -> PathBuf {
        let path = temp.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    fn lint(temp: &TempDir, config: &LinterConfig) -> Vec<LintResult> {
        let engine = Engine::new(EngineOptions::default()).unwrap();
        lint_paths(&engine, &RegoParser::new(), config, &[temp.path().to_path_buf()]).unwrap()
    }

    fn rule_ids(result: &LintResult) -> Vec<&str> {
        result.diagnostics.iter().map(|d| d.rule_id.as_str()).collect()
    }

    #[test]
    fn test_lint_paths_reports_unresolved_import() {
        let temp = TempDir::new().unwrap();
        write(&temp, "foo.rego", "package foo\nimport data.bar\nimport data.baz\n");
        write(&temp, "bar.rego", "package qux\n");
        write(&temp, "baz.rego", "package baz\n");

        let results = lint(&temp, &LinterConfig::default());

        assert_eq!(results.len(), 3);
        let foo = results.iter().find(|r| r.path.ends_with("foo.rego")).unwrap();
        assert_eq!(rule_ids(foo), vec!["unresolved-import"]);
        assert!(foo.has_errors());
        assert!(results.iter().filter(|r| r != &foo).all(|r| r.diagnostics.is_empty()));
    }

    #[test]
    fn test_lint_paths_parse_errors_and_ignore() {
        let temp = TempDir::new().unwrap();
        write(&temp, "broken.rego", "package foo\nallow if {\n");
        write(&temp, "vendor/skip.rego", "not a policy");

        let mut config = LinterConfig::default();
        config.ignore = vec!["vendor/**".to_string()];
        config.base_dir = Some(temp.path().to_path_buf());

        let results = lint(&temp, &config);

        assert_eq!(results.len(), 1);
        assert_eq!(rule_ids(&results[0]), vec!["parse-error"]);
    }

    #[test]
    fn test_lint_paths_bundle_roots() {
        let temp = TempDir::new().unwrap();
        write(&temp, "policy/foo.rego", "package foo\nimport data.users.admins\n");
        write(
            &temp,
            "bundles/users/.manifest",
            &json!({ "roots": ["users"] }).to_string(),
        );

        let mut config = LinterConfig::default();
        config.bundles = vec!["bundles".to_string()];
        config.base_dir = Some(temp.path().to_path_buf());

        let results = lint(&temp, &config);
        assert_eq!(results.len(), 1);
        assert!(results[0].diagnostics.is_empty());
    }
}
