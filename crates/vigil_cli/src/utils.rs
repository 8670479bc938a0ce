//! CLI utility functions

use std::env;
use std::path::PathBuf;

use miette::{IntoDiagnostic, Result};
use tokio::runtime::Runtime;
use vigil_core::LinterConfig;

pub fn create_tokio_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()
}

/// Loads the configuration from `--config`, or from the current directory.
pub fn load_config(path: Option<&PathBuf>) -> Result<LinterConfig> {
    if let Some(path) = path {
        return LinterConfig::from_file(path).into_diagnostic();
    }

    let cwd = env::current_dir().into_diagnostic()?;
    match LinterConfig::discover(&cwd) {
        Some(path) => LinterConfig::from_file(path).into_diagnostic(),
        None => Ok(LinterConfig {
            base_dir: Some(cwd),
            ..LinterConfig::default()
        }),
    }
}
