//! Console output for the upgrade run.

use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::checkpoint::CheckpointRecord;
use crate::config::Config;
use crate::license::LicenseVerdict;
use crate::workflow::{PhaseOutcome, RunSummary, WorkflowPhase};

/// Row of the phase plan table.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "PHASE")]
    number: u8,
    #[tabled(rename = "NAME")]
    title: &'static str,
    #[tabled(rename = "TARGET")]
    target: String,
    #[tabled(rename = "ACTION")]
    action: String,
}

/// Human readable byte size, e.g. `1.50 GiB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

pub fn print_banner(config: &Config) {
    println!();
    println!("{}", "CyberController HA Upgrade".bold());
    println!("{}", "=".repeat(40));
    println!("  Primary:      {}", config.primary.address);
    println!("  Secondary:    {}", config.secondary.address);
    println!(
        "  Upgrade file: {} ({})",
        config.upgrade_file.display(),
        format_size(config.file_size)
    );
}

pub fn print_large_file_warning(config: &Config) {
    println!();
    println!(
        "{}",
        format!(
            "Warning: {} is {}. The upload may take a long time and needs a stable connection.",
            config.upgrade_file.display(),
            format_size(config.file_size)
        )
        .yellow()
        .bold()
    );
}

pub fn print_previous_session(record: &CheckpointRecord) {
    println!();
    println!(
        "{} from {}",
        "Found previous upgrade session".bold(),
        record.timestamp.to_rfc3339()
    );
    println!("  Last checkpoint: phase {} ({})", record.phase, record.status);
}

/// Print what will happen to each phase from `start` on.
pub fn print_plan(start: u8, verdict: LicenseVerdict) {
    let rows: Vec<PlanRow> = WorkflowPhase::ALL
        .iter()
        .map(|phase| {
            let action = if phase.number() < start {
                "done".to_string()
            } else if phase.requires_license() && !verdict.eligible() {
                "skip (license)".to_string()
            } else {
                "run".to_string()
            };
            PlanRow {
                number: phase.number(),
                title: phase.title(),
                target: phase.target().to_string(),
                action,
            }
        })
        .collect();

    println!();
    println!("{}", "Upgrade plan:".bold());
    let mut table = Table::new(&rows);
    table.with(Style::rounded());
    println!("{}", table);
}

pub fn print_phase_header(phase: WorkflowPhase) {
    println!();
    println!(
        "{}",
        format!("Phase [{}/7]: {}", phase.number(), phase.title())
            .cyan()
            .bold()
    );
}

pub fn print_phase_done(phase: WorkflowPhase) {
    println!("  {} {}", "✓".green(), phase.title());
}

pub fn print_phase_skipped(phase: WorkflowPhase, reason: &str) {
    println!();
    println!(
        "{} {}",
        format!("Phase [{}/7]: {}", phase.number(), phase.title()).dimmed(),
        format!("skipped ({})", reason).yellow()
    );
}

pub fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "Upgrade summary:".bold());
    println!("{}", "-".repeat(40));
    for (phase, outcome) in &summary.phases {
        let status = match outcome {
            PhaseOutcome::Completed => "completed".green(),
            PhaseOutcome::Skipped => "skipped".yellow(),
            PhaseOutcome::AlreadyDone => "already done".dimmed(),
        };
        println!("  {:<40} {}", phase.to_string(), status);
    }

    if summary.migration_skipped() {
        println!();
        println!(
            "  {} Configuration migration was skipped because no valid CyberController Plus license was found",
            "⚠".yellow()
        );
    }
    for role in &summary.unverified {
        println!(
            "  {} New software version on the {} controller was not confirmed; check it manually",
            "⚠".yellow(),
            role
        );
    }
    if let Some(path) = &summary.archived {
        println!("  Checkpoint archived to {}", path.display());
    }
    println!();
    println!("{}", "HA upgrade completed".green().bold());
}

/// Manual recovery steps after a fatal error.
pub fn print_recovery_guidance(checkpoint: &std::path::Path) {
    eprintln!();
    eprintln!("{}", "The upgrade stopped before completion.".red().bold());
    eprintln!("  Progress was saved to {}", checkpoint.display());
    eprintln!("  Before re-running:");
    eprintln!("    1. Check HA status and software version on both controllers in the web UI");
    eprintln!("    2. Fix the reported error (credentials, connectivity, image file)");
    eprintln!("    3. Run ccup again; a failed run restarts from phase 1");
    eprintln!("  If HA is disabled and cannot be re-established, recreate it manually from the primary");
}
