//! Linter configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use globset::{Glob, GlobSet, GlobSetBuilder};
use jsonc_parser::ParseOptions;
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vigil_types::Severity;

use crate::LinterError;

// Embed the schema
const SCHEMA_JSON: &str = include_str!("../schemas/v1/config.json");
static CONFIG_SCHEMA: OnceLock<Result<Validator, String>> = OnceLock::new();

/// Configuration for the linter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinterConfig {
    /// Rule configuration (enable/disable/level/options).
    #[serde(default)]
    pub rules: BTreeMap<String, RuleOption>,

    /// Glob patterns of files to ignore.
    #[serde(default)]
    pub ignore: Vec<String>,

    /// Directories searched for data bundles.
    #[serde(default)]
    pub bundles: Vec<String>,

    /// Workspace-level scheduling settings.
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Base directory for resolving relative paths (ignore patterns, bundles).
    /// This is usually the directory containing the configuration file.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// Workspace-level scheduling settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Interval of periodic full workspace passes, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker_interval_ms: Option<u64>,
}

/// Configuration for a single rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RuleOption {
    /// Rule is enabled/disabled (boolean).
    Enabled(bool),
    /// Rule is enabled with a level ("error", "warning", "info") or disabled ("off").
    Level(String),
    /// Rule is enabled with an options object, optionally carrying a `level`.
    Options(serde_json::Value),
}

impl RuleOption {
    /// Returns whether the rule is enabled.
    pub fn is_enabled(&self) -> bool {
        match self {
            RuleOption::Enabled(enabled) => *enabled,
            RuleOption::Level(level) => level != "off",
            RuleOption::Options(v) => v.get("level").and_then(|l| l.as_str()) != Some("off"),
        }
    }

    /// Returns the configured severity, if any.
    pub fn severity(&self) -> Option<Severity> {
        match self {
            RuleOption::Enabled(_) => None,
            RuleOption::Level(level) => Severity::from_level(level),
            RuleOption::Options(v) => v
                .get("level")
                .and_then(|l| l.as_str())
                .and_then(Severity::from_level),
        }
    }

    /// Gets the rule options as JSON value, without the `level` key.
    pub fn options(&self) -> serde_json::Value {
        match self {
            RuleOption::Enabled(_) | RuleOption::Level(_) => serde_json::Value::Null,
            RuleOption::Options(v) => {
                let mut v = v.clone();
                if let Some(map) = v.as_object_mut() {
                    map.remove("level");
                }
                v
            }
        }
    }
}

impl LinterConfig {
    /// Configuration file names, in lookup order.
    pub const CONFIG_FILES: &'static [&'static str] = &[".vigil.jsonc", ".vigil.json"];

    /// Creates a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the configuration file in `root`.
    pub fn discover(root: impl AsRef<Path>) -> Option<PathBuf> {
        let root = root.as_ref();
        Self::CONFIG_FILES
            .iter()
            .map(|name| root.join(name))
            .find(|path| path.is_file())
    }

    /// Returns true if `path` is a configuration file name.
    pub fn is_config_file(path: impl AsRef<Path>) -> bool {
        path.as_ref()
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| Self::CONFIG_FILES.contains(&name))
    }

    /// Loads configuration from a file.
    ///
    /// Supports `.vigil.jsonc`, `.vigil.json`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LinterError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| LinterError::config(format!("Failed to read config: {}", e)))?;

        let mut config = Self::from_json(&content)?;
        if let Some(parent) = path.parent() {
            config.base_dir = Some(parent.to_path_buf());
        }

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parses configuration from a JSON (or JSONC) string with schema validation.
    pub fn from_json(json: &str) -> Result<Self, LinterError> {
        let value = jsonc_parser::parse_to_serde_value(json, &ParseOptions::default())
            .map_err(|e| LinterError::config(format!("Invalid JSON: {}", e)))?
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));

        let schema = config_schema()?;
        if let Err(e) = schema.validate(&value) {
            let error_msg = format!("{} at {}", e, e.instance_path());
            return Err(LinterError::config(format!(
                "Config validation failed: {}",
                error_msg
            )));
        }

        serde_json::from_value(value)
            .map_err(|e| LinterError::config(format!("Invalid config: {}", e)))
    }

    /// Builds the matcher for the `ignore` patterns.
    pub fn ignore_matcher(&self) -> Result<IgnoreMatcher, LinterError> {
        IgnoreMatcher::new(&self.ignore, self.base_dir.clone())
    }

    /// Bundle roots, resolved against the configuration directory.
    pub fn bundle_roots(&self) -> Vec<PathBuf> {
        self.bundles
            .iter()
            .map(|root| match &self.base_dir {
                Some(base) => base.join(root),
                None => PathBuf::from(root),
            })
            .collect()
    }

    /// Computes a hash of the configuration for change detection.
    pub fn hash(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        blake3::hash(json.as_bytes()).to_hex().to_string()
    }
}

fn config_schema() -> Result<&'static Validator, LinterError> {
    CONFIG_SCHEMA
        .get_or_init(|| {
            let schema_json: serde_json::Value =
                serde_json::from_str(SCHEMA_JSON).map_err(|e| e.to_string())?;
            Validator::new(&schema_json).map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| LinterError::Internal(format!("Invalid embedded config schema: {}", e)))
}

/// Compiled `ignore` patterns.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    globs: Option<GlobSet>,
    base_dir: Option<PathBuf>,
}

impl IgnoreMatcher {
    /// Compiles `patterns`; relative paths are matched against `base_dir`.
    pub fn new(patterns: &[String], base_dir: Option<PathBuf>) -> Result<Self, LinterError> {
        if patterns.is_empty() {
            return Ok(Self {
                globs: None,
                base_dir,
            });
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| LinterError::config(format!("Invalid glob pattern: {}", e)))?;
            builder.add(glob);
        }
        let globs = builder
            .build()
            .map_err(|e| LinterError::config(format!("Failed to build globset: {}", e)))?;

        Ok(Self {
            globs: Some(globs),
            base_dir,
        })
    }

    /// Returns true if `path` matches any ignore pattern.
    ///
    /// Both the path as given and its form relative to the base directory are
    /// tried, so `vendor/**` matches `/ws/vendor/x.rego` when the base is `/ws`.
    pub fn is_ignored(&self, path: impl AsRef<Path>) -> bool {
        let Some(globs) = &self.globs else {
            return false;
        };
        let path = path.as_ref();
        if globs.is_match(path) {
            return true;
        }
        self.base_dir
            .as_deref()
            .and_then(|base| path.strip_prefix(base).ok())
            .is_some_and(|relative| globs.is_match(relative))
    }
}
