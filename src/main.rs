//! ccup - CyberController HA pair rolling upgrade CLI tool.
//!
//! Upgrades both controllers of an HA pair one at a time:
//! - Break HA and upgrade the secondary, then the primary
//! - Migrate the DefenseFlow configuration between them (Plus license only)
//! - Restore the secondary router ID and re-establish HA
//!
//! Every phase is checkpointed so an interrupted run can be resumed.

mod api;
mod checkpoint;
mod config;
mod error;
mod license;
mod output;
mod poll;
mod preflight;
mod prompt;
mod upload;
mod workflow;

use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::{debug, error};

use api::HttpApplianceClient;
use config::{Args, Config};
use error::CcupError;
use license::{LicenseGate, LicenseVerdict};
use prompt::{InteractiveOperator, Operator};
use upload::{ResilientUploader, UploadPolicy};
use workflow::{NOTHING_LEFT, Orchestrator};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    if let Err(e) = init_tracing(&args.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    debug!("Starting ccup - CyberController HA upgrade tool");

    let operator = InteractiveOperator::new(args.yes);
    let config = match Config::resolve(args, &operator) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&config, &operator).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Main application logic.
async fn run(config: &Config, operator: &dyn Operator) -> Result<()> {
    let api = Arc::new(HttpApplianceClient::new(config)?);

    if config.preflight {
        let report = preflight::run_preflight(api.as_ref(), config).await;
        report.print();
        if !report.passed() {
            bail!("Preflight checks failed");
        }
        return Ok(());
    }

    output::print_banner(config);
    if config.is_large_file() {
        output::print_large_file_warning(config);
        if !operator.confirm("Continue with this upgrade file?", false)? {
            return Err(CcupError::UserCancelled.into());
        }
    }

    let uploader = ResilientUploader::new(api.clone(), UploadPolicy::default()).with_progress_bar(true);
    let mut orchestrator = Orchestrator::new(api.clone(), config, operator).with_uploader(uploader);

    let start = orchestrator.plan_start()?;
    let verdict = if start >= NOTHING_LEFT {
        LicenseVerdict::new(false)
    } else {
        LicenseGate::evaluate(api.as_ref(), &config.primary).await?
    };

    output::print_plan(start, verdict);
    if start < NOTHING_LEFT && !operator.confirm("Start the upgrade?", true)? {
        return Err(CcupError::UserCancelled.into());
    }

    let summary = match orchestrator.run(start, verdict).await {
        Ok(summary) => summary,
        Err(e) => {
            output::print_recovery_guidance(&orchestrator.store().path());
            return Err(e);
        }
    };

    output::print_summary(&summary);
    Ok(())
}

/// Initialize tracing subscriber.
fn init_tracing(log_level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {}", e))?;

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
