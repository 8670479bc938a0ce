//! Subcommand implementations

mod init;
mod lint;
mod lsp;
mod rules;

pub use init::run_init;
pub use lint::run_lint;
pub use lsp::run_lsp;
pub use rules::run_rules_list;
