//! Lint command implementation

use std::path::PathBuf;

use miette::{IntoDiagnostic, Result};
use vigil_core::{Engine, EngineOptions, LinterConfig, RegoParser, lint_paths};

use crate::cli::OutputFormat;
use crate::output::output_results;

pub fn run_lint(config: &LinterConfig, paths: &[PathBuf], format: OutputFormat) -> Result<bool> {
    let engine = Engine::new(EngineOptions::default()).into_diagnostic()?;
    let results = lint_paths(&engine, &RegoParser::new(), config, paths).into_diagnostic()?;

    output_results(&results, format)
}
