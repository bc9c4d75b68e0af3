//! Read-only prerequisite checks (`--preflight`).

use std::path::Path;

use colored::Colorize;
use sysinfo::{Disks, System};
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tracing::debug;

use crate::api::ApplianceApi;
use crate::config::{Config, NodeConfig, upgrade_file_size};
use crate::output::format_size;

/// Assumed average throughput to the controllers.
const ESTIMATE_BYTES_PER_MINUTE: u64 = 4 * 1024 * 1024;

/// Available memory should cover a tenth of the image.
const MEMORY_SHARE: u64 = 10;

/// Free space in the work directory should cover a fifth of the image.
const DISK_SHARE: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Fail,
    Info,
}

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    fn new(name: impl Into<String>, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "CHECK")]
    name: String,
    #[tabled(rename = "RESULT")]
    status: String,
    #[tabled(rename = "DETAIL")]
    detail: String,
}

#[derive(Debug, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.status != CheckStatus::Fail)
    }

    pub fn print(&self) {
        let rows: Vec<CheckRow> = self
            .checks
            .iter()
            .map(|c| CheckRow {
                name: c.name.clone(),
                status: match c.status {
                    CheckStatus::Pass => "PASS".green().to_string(),
                    CheckStatus::Fail => "FAIL".red().to_string(),
                    CheckStatus::Info => "INFO".blue().to_string(),
                },
                detail: c.detail.clone(),
            })
            .collect();

        println!();
        println!("{}", "Preflight checks:".bold());
        let mut table = Table::new(&rows);
        table.with(Style::rounded());
        println!("{}", table);

        if self.passed() {
            println!("{}", "All prerequisites passed".green().bold());
        } else {
            println!("{}", "Prerequisite checks failed".red().bold());
        }
    }
}

/// Minutes to transfer `bytes` to one controller, rounded up.
pub fn estimate_upload_minutes(bytes: u64) -> u64 {
    bytes.div_ceil(ESTIMATE_BYTES_PER_MINUTE)
}

fn available_memory() -> Option<u64> {
    let mut system = System::new();
    system.refresh_memory();
    Some(system.available_memory()).filter(|&bytes| bytes > 0)
}

/// Free space on the filesystem holding `path`, matched by longest mount point.
fn available_disk(path: &Path) -> Option<u64> {
    let path = std::fs::canonicalize(path).ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Low resources are reported but do not fail the preflight.
fn resource_check(name: &str, available: Option<u64>, required: u64) -> CheckResult {
    match available {
        None => CheckResult::new(name, CheckStatus::Info, "could not be determined"),
        Some(bytes) if bytes < required => CheckResult::new(
            name,
            CheckStatus::Info,
            format!("low: {} available, {} recommended", format_size(bytes), format_size(required)),
        ),
        Some(bytes) => CheckResult::new(name, CheckStatus::Pass, format!("{} available", format_size(bytes))),
    }
}

async fn check_login<A: ApplianceApi + ?Sized>(api: &A, node: &NodeConfig) -> CheckResult {
    let name = format!("Login to {}", node.role);
    match api.login(&node.base_url(), &node.credentials).await {
        Ok(true) => CheckResult::new(name, CheckStatus::Pass, node.address.clone()),
        Ok(false) => CheckResult::new(name, CheckStatus::Fail, "credentials rejected"),
        Err(e) => CheckResult::new(name, CheckStatus::Fail, e.to_string()),
    }
}

/// Run every check without changing anything on the controllers.
pub async fn run_preflight<A: ApplianceApi + ?Sized>(api: &A, config: &Config) -> PreflightReport {
    let mut report = PreflightReport::default();

    report.checks.push(match upgrade_file_size(&config.upgrade_file) {
        Ok(0) => CheckResult::new("Upgrade file", CheckStatus::Fail, "file is empty"),
        Ok(size) => CheckResult::new(
            "Upgrade file",
            CheckStatus::Pass,
            format!("{} ({})", config.upgrade_file.display(), format_size(size)),
        ),
        Err(e) => CheckResult::new("Upgrade file", CheckStatus::Fail, e.to_string()),
    });

    report.checks.push(resource_check(
        "Host memory",
        available_memory(),
        config.file_size / MEMORY_SHARE,
    ));
    report.checks.push(resource_check(
        "Work directory disk space",
        available_disk(&config.work_dir),
        config.file_size / DISK_SHARE,
    ));

    let primary = check_login(api, &config.primary).await;
    let primary_ok = primary.status == CheckStatus::Pass;
    report.checks.push(primary);
    report.checks.push(check_login(api, &config.secondary).await);

    if primary_ok {
        let license = match api.check_license(&config.primary.base_url()).await {
            Ok(true) => CheckResult::new(
                "CyberController Plus license",
                CheckStatus::Pass,
                "configuration will be migrated",
            ),
            Ok(false) => CheckResult::new(
                "CyberController Plus license",
                CheckStatus::Info,
                "not found, configuration migration will be skipped",
            ),
            Err(e) => CheckResult::new("CyberController Plus license", CheckStatus::Fail, e.to_string()),
        };
        report.checks.push(license);
    }

    let minutes = estimate_upload_minutes(config.file_size);
    debug!("Upload estimate: {} minutes per controller", minutes);
    report.checks.push(CheckResult::new(
        "Upload estimate",
        CheckStatus::Info,
        format!("~{} minutes per controller at 4 MiB/min", minutes),
    ));

    report
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::api::fake::FakeApi;
    use crate::config::testing::config_for;

    #[test]
    fn test_estimate_upload_minutes() {
        assert_eq!(estimate_upload_minutes(0), 0);
        assert_eq!(estimate_upload_minutes(1), 1);
        assert_eq!(estimate_upload_minutes(9 * 1024 * 1024 * 1024), 2304);
    }

    #[test]
    fn test_resource_check_thresholds() {
        let gib = 1024 * 1024 * 1024;
        assert_eq!(resource_check("Host memory", Some(2 * gib), gib).status, CheckStatus::Pass);

        let low = resource_check("Host memory", Some(gib / 2), gib);
        assert_eq!(low.status, CheckStatus::Info);
        assert!(low.detail.starts_with("low:"));

        let unknown = resource_check("Work directory disk space", None, gib);
        assert_eq!(unknown.status, CheckStatus::Info);
    }

    #[test]
    fn test_available_disk_for_missing_directory() {
        assert_eq!(available_disk(Path::new("/nonexistent/ccup-work")), None);
    }

    #[tokio::test]
    async fn test_preflight_passes_with_valid_setup() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"image").unwrap();
        let config = config_for("cc-primary", "cc-secondary", file.path(), 5);
        let api = FakeApi::default().with_license(false);

        let report = run_preflight(&api, &config).await;
        assert!(report.passed());
        assert_eq!(report.checks.len(), 7);
        let license = report
            .checks
            .iter()
            .find(|c| c.name == "CyberController Plus license")
            .unwrap();
        assert_eq!(license.status, CheckStatus::Info);
        assert!(report.checks.iter().any(|c| c.name == "Host memory"));
        assert!(report.checks.iter().any(|c| c.name == "Work directory disk space"));
        assert!(api.calls().iter().all(|c| !c.starts_with("break_cluster")));
    }

    #[tokio::test]
    async fn test_preflight_fails_on_rejected_login() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"image").unwrap();
        let config = config_for("cc-primary", "cc-secondary", file.path(), 5);
        let api = FakeApi::default().reject_login("https://cc-primary");

        let report = run_preflight(&api, &config).await;
        assert!(!report.passed());
        // license is not queried without a primary session
        assert!(api.calls_to("check_license").is_empty());
    }
}
