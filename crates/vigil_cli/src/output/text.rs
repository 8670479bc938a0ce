//! Text output formatter

use vigil_core::{LintResult, Severity};

pub fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
        Severity::Info => "info",
    }
}

pub fn output_text(results: &[LintResult]) {
    for result in results {
        if result.diagnostics.is_empty() {
            continue;
        }

        println!("\n{}:", result.path.display());
        for diag in &result.diagnostics {
            // Locations are zero-based; editors count from one.
            println!(
                "  {}:{} {} [{}]: {}",
                diag.loc.start.line + 1,
                diag.loc.start.character + 1,
                severity_label(diag.severity),
                diag.rule_id,
                diag.message
            );
        }
    }

    let total_files = results.len();
    let total_issues: usize = results.iter().map(|r| r.diagnostics.len()).sum();

    println!();
    println!(
        "Checked {} files, found {} issues",
        total_files, total_issues
    );
}
