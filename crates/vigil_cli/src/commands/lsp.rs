//! LSP command implementation

use std::path::PathBuf;
use std::time::Duration;

use miette::{IntoDiagnostic, Result};
use vigil_core::EngineOptions;
use vigil_lsp::ServerOptions;

use crate::utils::create_tokio_runtime;

pub fn run_lsp(
    config: Option<PathBuf>,
    hot_reload_rules: Option<PathBuf>,
    ticker_interval: Option<u64>,
) -> Result<()> {
    // Watched-file events carry absolute paths.
    let config_path = config
        .map(|path| std::path::absolute(path).into_diagnostic())
        .transpose()?;
    if let Some(path) = &config_path
        && !path.is_file()
    {
        return Err(miette::miette!("Config file not found: {}", path.display()));
    }

    let options = ServerOptions {
        ticker_interval: ticker_interval.map(Duration::from_millis),
        config_path,
        ..ServerOptions::default()
    };
    let engine_options = EngineOptions {
        hot_reload_dir: hot_reload_rules,
    };

    create_tokio_runtime()?
        .block_on(vigil_lsp::run(options, engine_options))
        .into_diagnostic()
}
