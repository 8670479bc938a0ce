//! Rule catalog.
//!
//! The catalog lists the built-in rules with their default severity and
//! options. It ships embedded in the binary and is compiled through the
//! [`EvaluationCache`](vigil_cache::EvaluationCache), which lets a development
//! build swap in an edited copy without restarting.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use vigil_cache::{CacheError, QueryCompiler};
use vigil_types::Severity;

use crate::rules::BUILTIN_RULES;
use crate::{LinterConfig, LinterError};

/// Cache key of the rule catalog.
pub const CATALOG_KEY: &str = "catalog";

/// The catalog compiled into the binary.
pub const EMBEDDED_CATALOG: &str = include_str!("../rules/catalog.json");

const CATALOG_VERSION: u32 = 1;

/// Catalog entry of one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub severity: Severity,
    /// Whether the rule needs facts from other files.
    #[serde(default)]
    pub aggregate: bool,
    /// Whether the rule runs when the configuration does not mention it.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
    /// Default options, overridden key by key from the configuration.
    #[serde(default)]
    pub options: serde_json::Value,
}

fn default_enabled() -> bool {
    true
}

/// The set of rules an engine can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCatalog {
    version: u32,
    /// Import prefixes that never need a workspace package.
    #[serde(default)]
    always_resolved: Vec<String>,
    rules: Vec<RuleDefinition>,
}

impl RuleCatalog {
    /// Parses and validates a catalog document.
    pub fn from_json(source: &str) -> Result<Self, LinterError> {
        let catalog: RuleCatalog = serde_json::from_str(source)
            .map_err(|e| LinterError::catalog(format!("Invalid catalog: {}", e)))?;

        if catalog.version != CATALOG_VERSION {
            return Err(LinterError::catalog(format!(
                "Unsupported catalog version {} (expected {})",
                catalog.version, CATALOG_VERSION
            )));
        }

        let mut seen = HashSet::new();
        for rule in &catalog.rules {
            if !BUILTIN_RULES.contains(&rule.name.as_str()) {
                return Err(LinterError::catalog(format!(
                    "Rule '{}' has no implementation",
                    rule.name
                )));
            }
            if !seen.insert(rule.name.as_str()) {
                return Err(LinterError::catalog(format!(
                    "Rule '{}' is defined twice",
                    rule.name
                )));
            }
        }

        Ok(catalog)
    }

    /// The embedded catalog.
    pub fn embedded() -> Result<Self, LinterError> {
        Self::from_json(EMBEDDED_CATALOG)
    }

    /// All rule definitions, in catalog order.
    pub fn rules(&self) -> &[RuleDefinition] {
        &self.rules
    }

    /// Looks up a rule by name.
    pub fn get(&self, name: &str) -> Option<&RuleDefinition> {
        self.rules.iter().find(|rule| rule.name == name)
    }

    /// Import prefixes that always resolve.
    pub fn always_resolved(&self) -> &[String] {
        &self.always_resolved
    }

    /// Resolves the rules enabled by `config`.
    ///
    /// Rules the configuration names but the catalog does not know are
    /// reported and skipped.
    pub fn enabled_rules(&self, config: &LinterConfig) -> EnabledRules {
        for name in config.rules.keys() {
            if self.get(name).is_none() {
                warn!("Unknown rule '{}' in configuration", name);
            }
        }

        let rules = self
            .rules
            .iter()
            .filter_map(|definition| {
                let configured = config.rules.get(&definition.name);
                let enabled = configured.map_or(definition.enabled, |option| option.is_enabled());
                if !enabled {
                    return None;
                }

                let severity = configured
                    .and_then(|option| option.severity())
                    .unwrap_or(definition.severity);
                let options = merge_options(
                    &definition.options,
                    configured.map(|option| option.options()),
                );

                Some(EnabledRule {
                    name: definition.name.clone(),
                    category: definition.category.clone(),
                    severity,
                    aggregate: definition.aggregate,
                    options,
                })
            })
            .collect();

        EnabledRules::new(rules)
    }
}

fn merge_options(
    defaults: &serde_json::Value,
    overrides: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut merged = match defaults {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let Some(serde_json::Value::Object(overrides)) = overrides {
        merged.extend(overrides);
    }
    serde_json::Value::Object(merged)
}

/// A rule with its effective settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EnabledRule {
    pub name: String,
    pub category: String,
    pub severity: Severity,
    pub aggregate: bool,
    /// Options object (catalog defaults merged with configuration).
    pub options: serde_json::Value,
}

/// The rules to run, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnabledRules(BTreeMap<String, EnabledRule>);

impl EnabledRules {
    /// Collects `rules` into a set.
    pub fn new(rules: Vec<EnabledRule>) -> Self {
        Self(
            rules
                .into_iter()
                .map(|rule| (rule.name.clone(), rule))
                .collect(),
        )
    }

    /// Names of all rules in the set.
    pub fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Looks up a rule by name.
    pub fn get(&self, name: &str) -> Option<&EnabledRule> {
        self.0.get(name)
    }

    /// Returns true if `name` is in the set.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Iterates over the rules in name order.
    pub fn iter(&self) -> impl Iterator<Item = &EnabledRule> {
        self.0.values()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no rule is enabled.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The subset of rules that need facts from other files.
    pub fn aggregate_only(&self) -> Self {
        self.filtered(|rule| rule.aggregate)
    }

    /// The subset of rules that look at one file at a time.
    pub fn without_aggregate(&self) -> Self {
        self.filtered(|rule| !rule.aggregate)
    }

    fn filtered(&self, keep: impl Fn(&EnabledRule) -> bool) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(_, rule)| keep(rule))
                .map(|(name, rule)| (name.clone(), rule.clone()))
                .collect(),
        )
    }
}

/// Compiles catalog documents for the [`EvaluationCache`](vigil_cache::EvaluationCache).
#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogCompiler;

impl QueryCompiler for CatalogCompiler {
    type Handle = Arc<RuleCatalog>;

    fn compile(&self, key: &str, source: &str) -> Result<Self::Handle, CacheError> {
        RuleCatalog::from_json(source)
            .map(Arc::new)
            .map_err(|e| CacheError::compile(key, e.to_string()))
    }
}
