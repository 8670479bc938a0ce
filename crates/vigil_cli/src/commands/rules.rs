//! Rules command implementation

use miette::{IntoDiagnostic, Result};
use vigil_core::{Engine, EngineOptions, Evaluator, LinterConfig};

use crate::output::text::severity_label;

pub fn run_rules_list(config: &LinterConfig) -> Result<()> {
    let engine = Engine::new(EngineOptions::default()).into_diagnostic()?;
    let catalog = engine.catalog().into_diagnostic()?;
    let enabled = engine.enabled_rules(config);

    println!(
        "{:<22} {:<10} {:<8} {:<8} Description",
        "Rule", "Category", "Level", "Enabled"
    );
    for rule in catalog.rules() {
        let (severity, is_enabled) = match enabled.get(&rule.name) {
            Some(active) => (active.severity, true),
            None => (rule.severity, false),
        };
        let name = if rule.aggregate {
            format!("{} *", rule.name)
        } else {
            rule.name.clone()
        };
        println!(
            "{:<22} {:<10} {:<8} {:<8} {}",
            name,
            rule.category,
            severity_label(severity),
            if is_enabled { "yes" } else { "no" },
            rule.description
        );
    }
    println!("\n* needs facts from other files");
    Ok(())
}
