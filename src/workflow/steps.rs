//! Phase bodies. Each returns the checkpoint data it produced.

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{Orchestrator, now};
use crate::api::{ApplianceApi, SoftwareImage};
use crate::checkpoint::CheckpointData;
use crate::config::{NodeConfig, NodeRole};
use crate::error::CcupError;
use crate::poll::{self, WaitResult};

const UNVERIFIED_VERSION: &str = "unverified";

fn payload(value: Value) -> CheckpointData {
    match value {
        Value::Object(map) => map,
        _ => CheckpointData::new(),
    }
}

impl<A: ApplianceApi + ?Sized + 'static> Orchestrator<'_, A> {
    async fn authenticate(&self, node: &NodeConfig) -> Result<()> {
        info!("Logging in to {}", node);
        let accepted = self
            .api
            .login(&node.base_url(), &node.credentials)
            .await
            .with_context(|| format!("Login request to {} failed", node))?;
        if !accepted {
            return Err(CcupError::Authentication(node.to_string()).into());
        }
        Ok(())
    }

    async fn settle(&self) {
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
    }

    /// Phase 1: break the cluster from the primary and wait until it reports disabled.
    pub(super) async fn disable_ha(&mut self) -> Result<CheckpointData> {
        let primary = &self.config.primary;
        let base_url = primary.base_url();
        self.authenticate(primary).await?;

        match self.api.cluster_status(&base_url).await {
            Ok(status) if status.is_disabled() => {
                info!("HA is already disabled on {}", primary);
            }
            _ => {
                info!("Breaking HA on {}", primary);
                self.api.break_cluster(&base_url).await?;
                if let WaitResult::Abandoned =
                    poll::wait_for_cluster_disabled(self.api.as_ref(), &base_url, self.operator).await?
                {
                    return Err(CcupError::UserCancelled.into());
                }
            }
        }

        Ok(payload(json!({ "ha_disabled_at": now() })))
    }

    /// Phases 2 and 4: upload, commit and wait for the new version to come up.
    pub(super) async fn upgrade_node(&mut self, role: NodeRole) -> Result<CheckpointData> {
        let node = self.config.node(role);
        let base_url = node.base_url();
        self.authenticate(node).await?;
        self.settle().await;

        let image = SoftwareImage::new(&self.config.upgrade_file, self.config.file_size);
        self.uploader
            .upload(&base_url, &image, self.config.upload_strategy, Some(&node.credentials))
            .await
            .into_result(&node.to_string())?;

        let version = match poll::wait_for_version_update(
            self.api.as_ref(),
            &base_url,
            &node.credentials,
            self.operator,
        )
        .await?
        {
            WaitResult::Satisfied(version) => {
                info!("{} is now running {}", node, version);
                version
            }
            WaitResult::Abandoned => {
                warn!(
                    "Could not confirm the new version on {}. Verify it manually before relying on it.",
                    node
                );
                self.unverified.push(role);
                UNVERIFIED_VERSION.to_string()
            }
        };

        Ok(payload(json!({
            format!("{role}_updated_at"): now(),
            format!("{role}_version"): version,
        })))
    }

    /// Phases 3 and 5: export the DefenseFlow configuration from one node and import it on the other.
    pub(super) async fn migrate_config(&mut self, from: NodeRole, to: NodeRole) -> Result<CheckpointData> {
        let source = self.config.node(from);
        let target = self.config.node(to);

        self.authenticate(source).await?;
        info!("Exporting DefenseFlow configuration from {}", source);
        let file = self
            .api
            .download_config(&source.base_url(), &self.config.work_dir)
            .await
            .with_context(|| format!("Failed to export configuration from {}", source))?;

        let size = std::fs::metadata(&file).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(CcupError::MissingData(format!(
                "exported configuration {} is empty",
                file.display()
            ))
            .into());
        }

        self.authenticate(target).await?;
        self.settle().await;
        info!("Importing {} on {}", file.display(), target);
        self.api
            .upload_config(&target.base_url(), &file)
            .await
            .with_context(|| format!("Failed to import configuration on {}", target))?;

        Ok(payload(json!({
            format!("{to}_config_file"): file.display().to_string(),
            format!("{to}_config_migrated_at"): now(),
        })))
    }

    /// Phase 6: push the secondary's BGP router ID to all of its network elements.
    pub(super) async fn configure_router_id(&mut self) -> Result<CheckpointData> {
        let secondary = &self.config.secondary;
        let base_url = secondary.base_url();
        self.authenticate(secondary).await?;

        let router_id = self
            .api
            .router_id(&base_url)
            .await?
            .ok_or_else(|| CcupError::MissingData(format!("BGP router ID on {}", secondary)))?;
        info!("Setting router ID {} on {}", router_id, secondary);

        let disabled = self.api.disable_protected_objects(&base_url).await?;
        info!("Disabled {} protected objects", disabled);

        let elements = self.api.network_element_names(&base_url).await?;
        if elements.is_empty() {
            info!("No network elements found on {}", secondary);
        }
        for name in &elements {
            match self
                .api
                .update_network_element_router_id(&base_url, name, &router_id)
                .await
            {
                Ok(()) => info!("Updated router ID for network element {}", name),
                Err(e) => warn!("Failed to update router ID for network element {}: {}", name, e),
            }
        }

        Ok(payload(json!({
            "router_id": router_id,
            "router_id_configured_at": now(),
        })))
    }

    /// Phase 7: establish HA from the primary and wait until both nodes are healthy.
    pub(super) async fn establish_ha(&mut self) -> Result<CheckpointData> {
        let primary = &self.config.primary;
        let secondary = &self.config.secondary;
        let base_url = primary.base_url();
        self.authenticate(primary).await?;

        match self.api.cluster_status(&base_url).await {
            Ok(status) if status.is_enabled() && status.is_healthy() => {
                info!("HA is already established and healthy");
            }
            _ => {
                info!("Establishing HA between {} and {}", primary, secondary);
                self.api
                    .establish_cluster(
                        &base_url,
                        &primary.address,
                        &secondary.address,
                        &secondary.credentials,
                    )
                    .await?;
            }
        }

        if let WaitResult::Abandoned =
            poll::wait_for_cluster_healthy(self.api.as_ref(), &base_url, self.operator).await?
        {
            return Err(CcupError::UserCancelled.into());
        }

        Ok(payload(json!({
            "ha_established_at": now(),
            "ha_healthy": true,
        })))
    }
}
