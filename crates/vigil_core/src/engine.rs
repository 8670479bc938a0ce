//! Rule evaluation.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use vigil_cache::{DirectoryQuerySource, EvaluationCache};
use vigil_types::{Aggregate, AggregateMap, Diagnostic, FileUri};

use crate::catalog::{CATALOG_KEY, CatalogCompiler, EMBEDDED_CATALOG, EnabledRules, RuleCatalog};
use crate::parser::{ImportRef, ParsedModule};
use crate::rules::{self, ImportResolver};
use crate::{LinterConfig, LinterError};

/// A parsed file handed to the evaluator.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub contents: String,
    pub module: ParsedModule,
}

/// Input of one evaluation.
#[derive(Debug, Clone, Default)]
pub struct EvalRequest {
    /// Files to run single-file rules on and to compute aggregates for.
    pub files: BTreeMap<FileUri, SourceFile>,
    /// Rules to run.
    pub enabled_rules: EnabledRules,
    /// Aggregates of files not in `files`, for aggregate rules.
    pub prior_aggregates: Option<AggregateMap>,
    /// Data document roots provided by bundles, e.g. `users.admins`.
    pub data_roots: BTreeSet<String>,
}

/// Result of one evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalOutput {
    /// Violations keyed by file.
    ///
    /// Every evaluated file has an entry, empty when it is clean, so callers
    /// can clear diagnostics from earlier runs.
    pub violations: BTreeMap<FileUri, Vec<Diagnostic>>,
    /// Aggregates computed for the files in the request.
    pub aggregates: AggregateMap,
    /// Problems with the request that did not stop evaluation.
    pub notices: Vec<String>,
}

/// Evaluates rules over parsed files.
pub trait Evaluator: Send + Sync {
    /// Resolves the rules `config` enables against the current catalog.
    fn enabled_rules(&self, config: &LinterConfig) -> EnabledRules;

    /// Identifies the catalog [`Evaluator::enabled_rules`] resolves against.
    ///
    /// A different value means rules resolved earlier may be out of date.
    fn catalog_revision(&self) -> u64 {
        0
    }

    /// Runs the enabled rules.
    ///
    /// Single-file rules run on `files`. Aggregate rules run on every file of
    /// `prior_aggregates` combined with the aggregates of `files`.
    fn evaluate(&self, request: &EvalRequest) -> Result<EvalOutput, LinterError>;
}

/// Facts about one module that aggregate rules need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleFacts {
    pub package: String,
    pub imports: Vec<ImportRef>,
}

impl ModuleFacts {
    /// Extracts the facts of a parsed module.
    pub fn from_module(module: &ParsedModule) -> Self {
        Self {
            package: module.package.clone(),
            imports: module.imports.clone(),
        }
    }

    /// Reads facts back from an aggregate.
    pub fn from_aggregate(aggregate: &Aggregate) -> Result<Self, LinterError> {
        serde_json::from_value(aggregate.payload().clone())
            .map_err(|e| LinterError::evaluation(format!("Malformed aggregate: {}", e)))
    }

    /// Wraps the facts as an opaque aggregate.
    pub fn to_aggregate(&self) -> Result<Aggregate, LinterError> {
        serde_json::to_value(self)
            .map(Aggregate::new)
            .map_err(|e| LinterError::evaluation(format!("Failed to encode aggregate: {}", e)))
    }
}

/// Options for [`Engine::new`].
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Directory holding an editable `catalog.json`, re-read on every evaluation.
    pub hot_reload_dir: Option<PathBuf>,
}

/// The built-in rule engine.
pub struct Engine {
    queries: EvaluationCache<CatalogCompiler>,
}

impl Engine {
    /// Creates an engine.
    ///
    /// Fails when no usable rule catalog can be compiled, which leaves the
    /// engine unable to run any rule.
    pub fn new(options: EngineOptions) -> Result<Self, LinterError> {
        let queries = match options.hot_reload_dir {
            Some(dir) => {
                info!("Hot-reloading rule catalog from {}", dir.display());
                EvaluationCache::with_hot_reload(
                    CatalogCompiler,
                    DirectoryQuerySource::new(dir, "json"),
                )
            }
            None => EvaluationCache::new(CatalogCompiler),
        };
        queries.get_or_set(CATALOG_KEY, EMBEDDED_CATALOG)?;

        Ok(Self { queries })
    }

    /// The current rule catalog.
    pub fn catalog(&self) -> Result<Arc<RuleCatalog>, LinterError> {
        Ok(self.queries.get_or_set(CATALOG_KEY, EMBEDDED_CATALOG)?)
    }
}

impl Evaluator for Engine {
    fn catalog_revision(&self) -> u64 {
        // Refreshes a hot-reloaded catalog before reading the revision.
        if let Err(e) = self.catalog() {
            debug!("Rule catalog unavailable: {}", e);
        }
        self.queries.revision()
    }

    fn enabled_rules(&self, config: &LinterConfig) -> EnabledRules {
        match self.catalog() {
            Ok(catalog) => catalog.enabled_rules(config),
            Err(e) => {
                error!("Rule catalog unavailable: {}", e);
                EnabledRules::default()
            }
        }
    }

    fn evaluate(&self, request: &EvalRequest) -> Result<EvalOutput, LinterError> {
        let catalog = self.catalog()?;
        let mut output = EvalOutput::default();

        for rule in request.enabled_rules.iter() {
            if catalog.get(&rule.name).is_none() {
                output
                    .notices
                    .push(format!("Rule '{}' is not in the catalog, skipped", rule.name));
            }
        }
        let runnable: Vec<_> = request
            .enabled_rules
            .iter()
            .filter(|rule| catalog.get(&rule.name).is_some())
            .collect();
        let (aggregate_rules, file_rules): (Vec<_>, Vec<_>) =
            runnable.into_iter().partition(|rule| rule.aggregate);

        let per_file: Vec<(FileUri, Vec<Diagnostic>, ModuleFacts)> = request
            .files
            .par_iter()
            .map(|(uri, file)| {
                let diagnostics = file_rules
                    .iter()
                    .flat_map(|rule| rules::check_file(rule, file))
                    .collect();
                (uri.clone(), diagnostics, ModuleFacts::from_module(&file.module))
            })
            .collect();

        let mut facts: BTreeMap<FileUri, ModuleFacts> = BTreeMap::new();
        for (uri, diagnostics, module_facts) in per_file {
            output.aggregates.insert(uri.clone(), module_facts.to_aggregate()?);
            output.violations.insert(uri.clone(), diagnostics);
            facts.insert(uri, module_facts);
        }

        if !aggregate_rules.is_empty() {
            if let Some(prior) = &request.prior_aggregates {
                for (uri, aggregate) in prior {
                    if !facts.contains_key(uri) {
                        facts.insert(uri.clone(), ModuleFacts::from_aggregate(aggregate)?);
                    }
                }
            }

            let resolver = ImportResolver::new(
                facts.values().map(|f| f.package.clone()),
                &request.data_roots,
                catalog.always_resolved().to_vec(),
            );
            for rule in aggregate_rules {
                for (uri, diagnostics) in rules::check_workspace(rule, &facts, &resolver) {
                    output.violations.entry(uri).or_default().extend(diagnostics);
                }
            }
        }

        for diagnostics in output.violations.values_mut() {
            Diagnostic::sort_for_display(diagnostics);
        }
        debug!(
            "Evaluated {} files ({} with aggregates)",
            request.files.len(),
            facts.len()
        );
        Ok(output)
    }
}
