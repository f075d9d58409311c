use colored::Colorize;

use homestak_engine::report::{PhaseStatus, RunReport};

/// Final result output for a verb: the trailer line under
/// `--structured-output`, a short human summary otherwise.
pub fn emit(report: &RunReport, structured: bool) {
    if structured {
        // Must be the last non-empty line on stdout.
        println!("{}", report.trailer_line());
        return;
    }

    let failed: Vec<&str> = report
        .phases
        .iter()
        .filter(|p| p.status == PhaseStatus::Failed)
        .map(|p| p.name.as_str())
        .collect();

    if report.success {
        println!(
            "{} {} completed in {:.1}s ({} phases)",
            "ok:".green().bold(),
            report.scenario,
            report.duration_seconds,
            report.phases.len(),
        );
    } else {
        println!(
            "{} {} failed after {:.1}s{}",
            "error:".red().bold(),
            report.scenario,
            report.duration_seconds,
            if failed.is_empty() {
                String::new()
            } else {
                format!(" (failed: {})", failed.join(", "))
            },
        );
        if let Some(error) = &report.error {
            println!("  {}", error);
        }
    }

    for (key, value) in &report.context {
        println!("  {} = {}", key.dimmed(), value);
    }
}
