//! Polling waiters for slow or eventually consistent controller state.
//!
//! A [`Probe`] fetches and classifies the remote state once; [`wait_for`]
//! turns it into a blocking wait with per-outcome sleep intervals and, for
//! the long software install, operator escalation.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{ApplianceApi, ClusterStatus};
use crate::config::Credentials;
use crate::error::{ApiResult, CcupError};
use crate::prompt::Operator;

/// Classification of a single poll.
#[derive(Debug)]
pub enum PollOutcome<T> {
    Satisfied(T),
    NotYetSatisfied,
    Transient(CcupError),
}

/// How a wait ended.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitResult<T> {
    Satisfied(T),
    /// The operator chose to stop waiting.
    Abandoned,
}

/// When to re-authenticate and when to ask the operator.
#[derive(Debug, Clone)]
pub struct Escalation {
    pub reauth_after: u32,
    pub confirm_after: u32,
    pub budget: Duration,
}

#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub label: &'static str,
    pub interval: Duration,
    pub transient_interval: Duration,
    pub escalation: Option<Escalation>,
}

impl PollPolicy {
    pub fn cluster_disabled() -> Self {
        Self {
            label: "HA disable",
            interval: Duration::from_secs(10),
            transient_interval: Duration::from_secs(5),
            escalation: None,
        }
    }

    pub fn cluster_healthy() -> Self {
        Self {
            label: "HA health",
            interval: Duration::from_secs(8),
            transient_interval: Duration::from_secs(8),
            escalation: None,
        }
    }

    pub fn version_update() -> Self {
        Self {
            label: "software update",
            interval: Duration::from_secs(20),
            transient_interval: Duration::from_secs(15),
            escalation: Some(Escalation {
                reauth_after: 5,
                confirm_after: 20,
                budget: Duration::from_secs(45 * 60),
            }),
        }
    }
}

/// One observation of remote state.
#[async_trait]
pub trait Probe: Send {
    type Output: Send;

    /// Fetch and classify. An `Err` is fatal and ends the wait.
    async fn poll(&mut self) -> ApiResult<PollOutcome<Self::Output>>;

    /// Refresh the session after repeated transient failures.
    async fn reauthenticate(&mut self) -> bool {
        false
    }
}

/// Drive `probe` until it is satisfied, fails, or the operator gives up.
pub async fn wait_for<P: Probe>(
    probe: &mut P,
    policy: &PollPolicy,
    operator: &dyn Operator,
) -> Result<WaitResult<P::Output>> {
    let mut transients = 0u32;
    let mut window_start = Instant::now();
    let started = Instant::now();

    loop {
        let delay = match probe.poll().await? {
            PollOutcome::Satisfied(value) => {
                info!(
                    "{} condition met after {}s",
                    policy.label,
                    started.elapsed().as_secs()
                );
                return Ok(WaitResult::Satisfied(value));
            }
            PollOutcome::NotYetSatisfied => {
                transients = 0;
                debug!("Waiting for {} ({}s elapsed)", policy.label, started.elapsed().as_secs());
                policy.interval
            }
            PollOutcome::Transient(e) => {
                transients += 1;
                warn!(
                    "{} check failed ({} consecutive): {}",
                    policy.label, transients, e
                );
                if let Some(esc) = &policy.escalation
                    && esc.reauth_after > 0
                    && transients % esc.reauth_after == 0
                {
                    info!("Re-authenticating after {} failed checks", transients);
                    if !probe.reauthenticate().await {
                        warn!("Re-authentication failed, continuing to poll");
                    }
                }
                policy.transient_interval
            }
        };

        if let Some(esc) = &policy.escalation {
            let over_budget = window_start.elapsed() >= esc.budget;
            if transients >= esc.confirm_after || over_budget {
                let reason = if over_budget {
                    format!("still waiting after {} minutes", window_start.elapsed().as_secs() / 60)
                } else {
                    format!("{} consecutive failed checks", transients)
                };
                let prompt = format!("{} is taking long ({}). Keep waiting?", policy.label, reason);
                if operator.confirm(&prompt, true)? {
                    transients = 0;
                    window_start = Instant::now();
                } else {
                    warn!("Stopped monitoring {} at operator request", policy.label);
                    return Ok(WaitResult::Abandoned);
                }
            }
        }

        tokio::time::sleep(delay).await;
    }
}

/// Satisfied once `haStatus` reports `disabled`.
pub struct ClusterDisabledProbe<'a, A: ?Sized> {
    api: &'a A,
    base_url: &'a str,
}

#[async_trait]
impl<'a, A: ApplianceApi + ?Sized> Probe for ClusterDisabledProbe<'a, A> {
    type Output = ClusterStatus;

    async fn poll(&mut self) -> ApiResult<PollOutcome<ClusterStatus>> {
        Ok(match self.api.cluster_status(self.base_url).await {
            Ok(status) if status.is_disabled() => PollOutcome::Satisfied(status),
            Ok(status) => {
                debug!("HA status: {:?}", status.ha_status);
                PollOutcome::NotYetSatisfied
            }
            Err(e) => PollOutcome::Transient(e),
        })
    }
}

/// Satisfied once both nodes report `healthy`.
pub struct ClusterHealthyProbe<'a, A: ?Sized> {
    api: &'a A,
    base_url: &'a str,
}

#[async_trait]
impl<'a, A: ApplianceApi + ?Sized> Probe for ClusterHealthyProbe<'a, A> {
    type Output = ClusterStatus;

    async fn poll(&mut self) -> ApiResult<PollOutcome<ClusterStatus>> {
        Ok(match self.api.cluster_status(self.base_url).await {
            Ok(status) if status.is_healthy() => PollOutcome::Satisfied(status),
            Ok(status) => {
                debug!(
                    "Primary health: {:?}, secondary health: {:?}",
                    status.primary_health, status.secondary_health
                );
                PollOutcome::NotYetSatisfied
            }
            Err(e) => PollOutcome::Transient(e),
        })
    }
}

/// Satisfied once the install reports `OK` with a version other than the baseline.
pub struct VersionUpdateProbe<'a, A: ?Sized> {
    api: &'a A,
    base_url: &'a str,
    credentials: &'a Credentials,
    baseline: Option<String>,
}

#[async_trait]
impl<'a, A: ApplianceApi + ?Sized> Probe for VersionUpdateProbe<'a, A> {
    type Output = String;

    async fn poll(&mut self) -> ApiResult<PollOutcome<String>> {
        let status = match self.api.update_status(self.base_url).await {
            Ok(status) => status,
            // the controller restarts during the install
            Err(e) => return Ok(PollOutcome::Transient(e)),
        };

        if status.failed() {
            return Err(CcupError::UpgradeFailed(self.base_url.to_string()));
        }

        match status.software_version.clone() {
            Some(version) if status.succeeded() && Some(&version) != self.baseline.as_ref() => {
                Ok(PollOutcome::Satisfied(version))
            }
            _ => {
                debug!("Upgrade status: {:?}", status.last_upgrade_status);
                Ok(PollOutcome::NotYetSatisfied)
            }
        }
    }

    async fn reauthenticate(&mut self) -> bool {
        matches!(self.api.login(self.base_url, self.credentials).await, Ok(true))
    }
}

pub async fn wait_for_cluster_disabled<A: ApplianceApi + ?Sized>(
    api: &A,
    base_url: &str,
    operator: &dyn Operator,
) -> Result<WaitResult<ClusterStatus>> {
    info!("Waiting for HA to be disabled on {}", base_url);
    let mut probe = ClusterDisabledProbe { api, base_url };
    wait_for(&mut probe, &PollPolicy::cluster_disabled(), operator).await
}

pub async fn wait_for_cluster_healthy<A: ApplianceApi + ?Sized>(
    api: &A,
    base_url: &str,
    operator: &dyn Operator,
) -> Result<WaitResult<ClusterStatus>> {
    info!("Waiting for both HA nodes to report healthy");
    let mut probe = ClusterHealthyProbe { api, base_url };
    wait_for(&mut probe, &PollPolicy::cluster_healthy(), operator).await
}

/// Wait for the software install on `base_url` to finish.
///
/// The version reported at call time is the baseline; a fetch failure here
/// leaves the baseline empty so any reported version counts as new.
pub async fn wait_for_version_update<A: ApplianceApi + ?Sized>(
    api: &A,
    base_url: &str,
    credentials: &Credentials,
    operator: &dyn Operator,
) -> Result<WaitResult<String>> {
    let baseline = match api.update_status(base_url).await {
        Ok(status) => status.software_version,
        Err(e) => {
            warn!("Could not read current version on {}: {}", base_url, e);
            None
        }
    };
    info!(
        "Monitoring software update on {} (current version: {})",
        base_url,
        baseline.as_deref().unwrap_or("unknown")
    );

    let mut probe = VersionUpdateProbe {
        api,
        base_url,
        credentials,
        baseline,
    };
    wait_for(&mut probe, &PollPolicy::version_update(), operator).await
}
