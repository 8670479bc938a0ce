//! # vigil_core
//!
//! Core linting pieces for Vigil.
//!
//! This crate provides:
//! - Configuration loading and validation
//! - The policy module parser
//! - The rule catalog and the built-in rule engine
//! - File discovery and one-shot linting
//!
//! ## Example
//!
//! ```rust,ignore
//! use vigil_core::{Engine, EngineOptions, LinterConfig, RegoParser, lint_paths};
//!
//! let config = LinterConfig::from_file(".vigil.jsonc")?;
//! let engine = Engine::new(EngineOptions::default())?;
//!
//! let results = lint_paths(&engine, &RegoParser::new(), &config, &["policies".into()])?;
//! for result in results {
//!     println!("{}: {} issues", result.path.display(), result.diagnostics.len());
//! }
//! ```

pub mod catalog;
mod config;
pub mod engine;
mod error;
mod linter;
pub mod parser;
mod rules;
pub mod walker;

pub use catalog::{CatalogCompiler, EnabledRule, EnabledRules, RuleCatalog, RuleDefinition};
pub use config::{IgnoreMatcher, LinterConfig, RuleOption, WorkspaceConfig};
pub use engine::{
    Engine, EngineOptions, EvalOutput, EvalRequest, Evaluator, ModuleFacts, SourceFile,
};
pub use error::LinterError;
pub use linter::{LintResult, lint_paths};
pub use parser::{ImportRef, PARSE_ERROR_RULE, ParsedModule, Parser, RegoParser};
pub use walker::{discover_files, is_policy_file};

pub use vigil_types::{Diagnostic, Severity};
