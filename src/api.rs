//! CyberController management API.
//!
//! The orchestration code only talks to [`ApplianceApi`]; [`client`] holds
//! the reqwest implementation used in production.

pub mod client;
#[cfg(test)]
pub mod fake;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::Credentials;
use crate::error::ApiResult;
use crate::upload::TransferStrategy;
use crate::upload::progress::TransferProgress;

pub use client::HttpApplianceClient;

/// HA cluster state as reported by the primary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "RawClusterStatus")]
pub struct ClusterStatus {
    pub ha_status: Option<String>,
    pub primary_health: Option<String>,
    pub secondary_health: Option<String>,
}

/// Older firmware reports the state as `clusterStatus`; some builds send both.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawClusterStatus {
    #[serde(default)]
    ha_status: Option<String>,
    #[serde(default)]
    cluster_status: Option<String>,
    #[serde(default)]
    primary_health: Option<String>,
    #[serde(default)]
    secondary_health: Option<String>,
}

impl From<RawClusterStatus> for ClusterStatus {
    fn from(raw: RawClusterStatus) -> Self {
        Self {
            ha_status: raw.ha_status.or(raw.cluster_status),
            primary_health: raw.primary_health,
            secondary_health: raw.secondary_health,
        }
    }
}

impl ClusterStatus {
    pub fn is_disabled(&self) -> bool {
        self.ha_status.as_deref() == Some("disabled")
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.ha_status.as_deref(), Some(s) if s != "disabled")
    }

    /// Both nodes report `healthy`.
    pub fn is_healthy(&self) -> bool {
        self.primary_health.as_deref() == Some("healthy")
            && self.secondary_health.as_deref() == Some("healthy")
    }
}

/// Software update state from the system settings endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UpdateStatus {
    #[serde(rename = "lastUpgradeStatus", default)]
    pub last_upgrade_status: Option<String>,
    #[serde(default)]
    pub software_version: Option<String>,
}

impl UpdateStatus {
    pub fn succeeded(&self) -> bool {
        self.last_upgrade_status.as_deref() == Some("OK")
    }

    pub fn failed(&self) -> bool {
        self.last_upgrade_status.as_deref() == Some("Failed")
    }
}

/// Upgrade image on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftwareImage {
    pub path: PathBuf,
    pub size: u64,
}

impl SoftwareImage {
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upgrade.tar.gz".to_string())
    }
}

/// Management operations the upgrade workflow needs from a controller.
///
/// Every call takes the node's base URL; the session cookie obtained by
/// [`ApplianceApi::login`] is kept by the implementation.
#[async_trait]
pub trait ApplianceApi: Send + Sync {
    /// Returns false when the controller rejects the credentials.
    async fn login(&self, base_url: &str, credentials: &Credentials) -> ApiResult<bool>;

    async fn break_cluster(&self, base_url: &str) -> ApiResult<()>;

    async fn cluster_status(&self, base_url: &str) -> ApiResult<ClusterStatus>;

    async fn router_id(&self, base_url: &str) -> ApiResult<Option<String>>;

    async fn network_element_names(&self, base_url: &str) -> ApiResult<Vec<String>>;

    async fn update_network_element_router_id(
        &self,
        base_url: &str,
        name: &str,
        router_id: &str,
    ) -> ApiResult<()>;

    /// Disable every protected object. Returns how many were disabled.
    async fn disable_protected_objects(&self, base_url: &str) -> ApiResult<usize>;

    async fn establish_cluster(
        &self,
        base_url: &str,
        primary_address: &str,
        secondary_address: &str,
        secondary_credentials: &Credentials,
    ) -> ApiResult<()>;

    /// Export the DefenseFlow configuration into `dest_dir`.
    async fn download_config(&self, base_url: &str, dest_dir: &Path) -> ApiResult<PathBuf>;

    async fn upload_config(&self, base_url: &str, file: &Path) -> ApiResult<()>;

    /// True when a valid CyberController Plus license is installed.
    async fn check_license(&self, base_url: &str) -> ApiResult<bool>;

    async fn update_status(&self, base_url: &str) -> ApiResult<UpdateStatus>;

    /// Transfer the upgrade image. Does not commit it.
    async fn send_software(
        &self,
        base_url: &str,
        image: &SoftwareImage,
        strategy: TransferStrategy,
        progress: Arc<TransferProgress>,
    ) -> ApiResult<()>;

    /// Install the previously transferred image.
    async fn commit_software(&self, base_url: &str) -> ApiResult<()>;
}
