//! Seven-phase rolling upgrade of the HA pair.
//!
//! The orchestrator persists a checkpoint before and after every phase so
//! that an interrupted run can pick up where it stopped. Phase bodies live
//! in [`steps`].

pub mod phase;
mod steps;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::api::ApplianceApi;
use crate::checkpoint::{
    CheckpointData, CheckpointPhase, CheckpointRecord, CheckpointStatus, CheckpointStore,
    merge_append_only,
};
use crate::config::{Config, NodeRole};
use crate::error::CcupError;
use crate::license::LicenseVerdict;
use crate::output;
use crate::prompt::Operator;
use crate::upload::{ResilientUploader, UploadPolicy};

pub use phase::WorkflowPhase;

/// Start phase meaning every phase is already done.
pub const NOTHING_LEFT: u8 = 8;

const SKIP_REASON: &str = "Invalid license";

/// How a phase ended in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Completed,
    Skipped,
    /// Completed by an earlier run.
    AlreadyDone,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub phases: Vec<(WorkflowPhase, PhaseOutcome)>,
    /// Nodes whose new version could not be confirmed.
    pub unverified: Vec<NodeRole>,
    pub archived: Option<PathBuf>,
}

impl RunSummary {
    pub fn outcome(&self, phase: WorkflowPhase) -> Option<PhaseOutcome> {
        self.phases
            .iter()
            .find(|(p, _)| *p == phase)
            .map(|(_, outcome)| *outcome)
    }

    pub fn migration_skipped(&self) -> bool {
        WorkflowPhase::ALL
            .into_iter()
            .filter(|p| p.requires_license())
            .any(|p| self.outcome(p) == Some(PhaseOutcome::Skipped))
    }
}

/// Phase to start from when resuming from `record`.
///
/// An error record restarts from phase 1, a completed phase moves on to the
/// next one, and anything else repeats the recorded phase.
pub fn resume_phase(record: &CheckpointRecord) -> u8 {
    match (record.phase, record.status) {
        (CheckpointPhase::Error, _) => 1,
        (CheckpointPhase::Step(n), CheckpointStatus::Completed) => n + 1,
        (CheckpointPhase::Step(n), _) => n,
    }
}

/// Drives the upgrade phases against both controllers.
pub struct Orchestrator<'a, A: ApplianceApi + ?Sized> {
    api: Arc<A>,
    config: &'a Config,
    store: CheckpointStore,
    operator: &'a dyn Operator,
    uploader: ResilientUploader<A>,
    settle_delay: Duration,
    data: CheckpointData,
    unverified: Vec<NodeRole>,
}

impl<'a, A: ApplianceApi + ?Sized + 'static> Orchestrator<'a, A> {
    pub fn new(api: Arc<A>, config: &'a Config, operator: &'a dyn Operator) -> Self {
        let uploader = ResilientUploader::new(api.clone(), UploadPolicy::default());
        Self {
            store: CheckpointStore::new(config.checkpoint_dir()),
            api,
            config,
            operator,
            uploader,
            settle_delay: config.settle_delay,
            data: CheckpointData::new(),
            unverified: Vec::new(),
        }
    }

    pub fn with_uploader(mut self, uploader: ResilientUploader<A>) -> Self {
        self.uploader = uploader;
        self
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Decide the start phase from the last checkpoint, asking the operator
    /// whether to resume. Seeds the accumulated data when resuming.
    pub fn plan_start(&mut self) -> Result<u8> {
        self.data.clear();

        let Some(record) = self.store.load() else {
            return Ok(1);
        };

        output::print_previous_session(&record);
        if !self
            .operator
            .confirm("Resume the previous upgrade session?", true)?
        {
            info!("Starting fresh from phase 1");
            return Ok(1);
        }

        let start = resume_phase(&record);
        match record.phase {
            CheckpointPhase::Error => {
                warn!("Previous run failed, restarting from phase 1");
            }
            CheckpointPhase::Step(_) => {
                self.data = record.data.clone();
            }
        }

        if record.status == CheckpointStatus::Starting
            && let Some(phase) = WorkflowPhase::from_number(start)
            && phase.is_software_upgrade()
        {
            let prompt = format!(
                "{} was interrupted. Upload and install the image again?",
                phase
            );
            if !self.operator.confirm(&prompt, false)? {
                return Err(CcupError::UserCancelled.into());
            }
        }

        if start >= NOTHING_LEFT {
            info!("All phases already completed");
        } else {
            info!("Resuming from phase {}", start);
        }
        Ok(start)
    }

    /// Run every phase from `start` onward.
    pub async fn run(&mut self, start: u8, verdict: LicenseVerdict) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        for phase in WorkflowPhase::ALL {
            let step = CheckpointPhase::Step(phase.number());

            if phase.number() < start {
                summary.phases.push((phase, PhaseOutcome::AlreadyDone));
                continue;
            }

            if phase.requires_license() && !verdict.eligible() {
                output::print_phase_skipped(phase, SKIP_REASON);
                self.data
                    .entry(format!("phase_{}_skip_reason", phase.number()))
                    .or_insert_with(|| Value::from(SKIP_REASON));
                self.store.save(step, CheckpointStatus::Skipped, &self.data);
                summary.phases.push((phase, PhaseOutcome::Skipped));
                continue;
            }

            output::print_phase_header(phase);
            self.store.save(step, CheckpointStatus::Starting, &self.data);

            match self.execute(phase).await {
                Ok(update) => {
                    let rejected = merge_append_only(&mut self.data, update);
                    if !rejected.is_empty() {
                        warn!("Kept earlier checkpoint values for {}", rejected.join(", "));
                    }
                    self.store.save(step, CheckpointStatus::Completed, &self.data);
                    output::print_phase_done(phase);
                    summary.phases.push((phase, PhaseOutcome::Completed));
                }
                Err(e) => {
                    let mut failed = self.data.clone();
                    failed.insert("error".to_string(), Value::from(format!("{e:#}")));
                    failed.insert("failed_at".to_string(), Value::from(now()));
                    self.store
                        .save(CheckpointPhase::Error, CheckpointStatus::Failed, &failed);
                    return Err(e).with_context(|| format!("{} failed", phase));
                }
            }
        }

        summary.unverified = std::mem::take(&mut self.unverified);
        summary.archived = self.store.archive();
        Ok(summary)
    }

    async fn execute(&mut self, phase: WorkflowPhase) -> Result<CheckpointData> {
        match phase {
            WorkflowPhase::DisableHa => self.disable_ha().await,
            WorkflowPhase::UpgradeSecondary => self.upgrade_node(NodeRole::Secondary).await,
            WorkflowPhase::MigrateConfigToSecondary => {
                self.migrate_config(NodeRole::Primary, NodeRole::Secondary).await
            }
            WorkflowPhase::UpgradePrimary => self.upgrade_node(NodeRole::Primary).await,
            WorkflowPhase::MigrateConfigToPrimary => {
                self.migrate_config(NodeRole::Secondary, NodeRole::Primary).await
            }
            WorkflowPhase::ConfigureRouterId => self.configure_router_id().await,
            WorkflowPhase::EstablishHa => self.establish_ha().await,
        }
    }
}

/// RFC 3339 UTC timestamp for checkpoint data.
fn now() -> String {
    Utc::now().to_rfc3339()
}
