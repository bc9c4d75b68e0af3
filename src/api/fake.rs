//! Scripted in-memory controller pair for tests.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ApplianceApi, ClusterStatus, SoftwareImage, UpdateStatus};
use crate::config::Credentials;
use crate::error::{ApiResult, CcupError};
use crate::upload::TransferStrategy;
use crate::upload::progress::TransferProgress;

/// Every call is recorded in `calls` as `"<operation> <base_url>"`.
/// Scripted queues are consumed first; once empty the fallback value is used.
pub struct FakeApi {
    calls: Mutex<Vec<String>>,
    rejected_logins: Mutex<HashSet<String>>,
    cluster_script: Mutex<VecDeque<ApiResult<ClusterStatus>>>,
    cluster_fallback: Mutex<ClusterStatus>,
    update_script: Mutex<VecDeque<ApiResult<UpdateStatus>>>,
    update_fallback: Mutex<UpdateStatus>,
    send_failures: AtomicU32,
    send_refusal: Option<u16>,
    transfer_time: Duration,
    commit_script: Mutex<VecDeque<ApiResult<()>>>,
    router_id: Mutex<Option<String>>,
    elements: Vec<String>,
    protected_objects: usize,
    license: AtomicBool,
    heartbeats: AtomicU32,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            rejected_logins: Mutex::new(HashSet::new()),
            cluster_script: Mutex::new(VecDeque::new()),
            cluster_fallback: Mutex::new(ClusterStatus {
                ha_status: Some("disabled".to_string()),
                ..Default::default()
            }),
            update_script: Mutex::new(VecDeque::new()),
            update_fallback: Mutex::new(UpdateStatus {
                last_upgrade_status: Some("OK".to_string()),
                software_version: Some("10.9.0".to_string()),
            }),
            send_failures: AtomicU32::new(0),
            send_refusal: None,
            transfer_time: Duration::ZERO,
            commit_script: Mutex::new(VecDeque::new()),
            router_id: Mutex::new(Some("10.10.10.1".to_string())),
            elements: vec!["ne-1".to_string(), "ne-2".to_string()],
            protected_objects: 3,
            license: AtomicBool::new(true),
            heartbeats: AtomicU32::new(0),
        }
    }
}

impl FakeApi {
    pub fn with_cluster_statuses(self, statuses: Vec<ApiResult<ClusterStatus>>) -> Self {
        *self.cluster_script.lock().unwrap() = statuses.into();
        self
    }

    pub fn with_cluster_fallback(self, status: ClusterStatus) -> Self {
        *self.cluster_fallback.lock().unwrap() = status;
        self
    }

    pub fn with_update_statuses(self, statuses: Vec<ApiResult<UpdateStatus>>) -> Self {
        *self.update_script.lock().unwrap() = statuses.into();
        self
    }

    pub fn with_send_failures(self, count: u32) -> Self {
        self.send_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Every transfer is answered with this HTTP status.
    pub fn with_send_status(mut self, status: u16) -> Self {
        self.send_refusal = Some(status);
        self
    }

    pub fn with_transfer_time(mut self, duration: Duration) -> Self {
        self.transfer_time = duration;
        self
    }

    pub fn with_commit_results(self, results: Vec<ApiResult<()>>) -> Self {
        *self.commit_script.lock().unwrap() = results.into();
        self
    }

    pub fn with_router_id(self, router_id: Option<&str>) -> Self {
        *self.router_id.lock().unwrap() = router_id.map(str::to_string);
        self
    }

    pub fn with_license(self, valid: bool) -> Self {
        self.license.store(valid, Ordering::SeqCst);
        self
    }

    pub fn reject_login(self, base_url: &str) -> Self {
        self.rejected_logins.lock().unwrap().insert(base_url.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose operation name equals `op`.
    pub fn calls_to(&self, op: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.split_whitespace().next() == Some(op))
            .collect()
    }

    pub fn login_calls(&self) -> Vec<String> {
        self.calls_to("login")
    }

    pub fn send_calls(&self) -> usize {
        self.calls_to("send_software").len()
    }

    pub fn commit_calls(&self) -> usize {
        self.calls_to("commit_software").len()
    }

    /// Number of `update_status` requests, which is what the keepalive sends.
    pub fn heartbeats(&self) -> u32 {
        self.heartbeats.load(Ordering::SeqCst)
    }

    fn record(&self, op: &str, base_url: &str) {
        self.calls.lock().unwrap().push(format!("{op} {base_url}"));
    }
}

#[async_trait]
impl ApplianceApi for FakeApi {
    async fn login(&self, base_url: &str, _credentials: &Credentials) -> ApiResult<bool> {
        self.record("login", base_url);
        Ok(!self.rejected_logins.lock().unwrap().contains(base_url))
    }

    async fn break_cluster(&self, base_url: &str) -> ApiResult<()> {
        self.record("break_cluster", base_url);
        Ok(())
    }

    async fn cluster_status(&self, base_url: &str) -> ApiResult<ClusterStatus> {
        self.record("cluster_status", base_url);
        let scripted = self.cluster_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(self.cluster_fallback.lock().unwrap().clone()))
    }

    async fn router_id(&self, base_url: &str) -> ApiResult<Option<String>> {
        self.record("router_id", base_url);
        Ok(self.router_id.lock().unwrap().clone())
    }

    async fn network_element_names(&self, base_url: &str) -> ApiResult<Vec<String>> {
        self.record("network_element_names", base_url);
        Ok(self.elements.clone())
    }

    async fn update_network_element_router_id(
        &self,
        base_url: &str,
        name: &str,
        router_id: &str,
    ) -> ApiResult<()> {
        self.record(&format!("update_router_id:{name}={router_id}"), base_url);
        Ok(())
    }

    async fn disable_protected_objects(&self, base_url: &str) -> ApiResult<usize> {
        self.record("disable_protected_objects", base_url);
        Ok(self.protected_objects)
    }

    async fn establish_cluster(
        &self,
        base_url: &str,
        _primary_address: &str,
        _secondary_address: &str,
        _secondary_credentials: &Credentials,
    ) -> ApiResult<()> {
        self.record("establish_cluster", base_url);
        Ok(())
    }

    async fn download_config(&self, base_url: &str, dest_dir: &Path) -> ApiResult<PathBuf> {
        self.record("download_config", base_url);
        let path = dest_dir.join("DefenseFlowConfiguration_test.zip");
        std::fs::write(&path, b"config").map_err(|e| CcupError::LocalIo(e.to_string()))?;
        Ok(path)
    }

    async fn upload_config(&self, base_url: &str, _file: &Path) -> ApiResult<()> {
        self.record("upload_config", base_url);
        Ok(())
    }

    async fn check_license(&self, base_url: &str) -> ApiResult<bool> {
        self.record("check_license", base_url);
        Ok(self.license.load(Ordering::SeqCst))
    }

    async fn update_status(&self, base_url: &str) -> ApiResult<UpdateStatus> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        self.record("update_status", base_url);
        let scripted = self.update_script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(self.update_fallback.lock().unwrap().clone()))
    }

    async fn send_software(
        &self,
        base_url: &str,
        image: &SoftwareImage,
        _strategy: TransferStrategy,
        progress: Arc<TransferProgress>,
    ) -> ApiResult<()> {
        self.record("send_software", base_url);
        if !self.transfer_time.is_zero() {
            tokio::time::sleep(self.transfer_time).await;
        }

        if let Some(status) = self.send_refusal {
            return Err(CcupError::from_status(
                "software.upload",
                status,
                "Payload Too Large".to_string(),
            ));
        }

        let remaining = self.send_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.send_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(CcupError::Transport(
                "software.upload".to_string(),
                "connection reset by peer".to_string(),
            ));
        }

        progress.record(image.size);
        Ok(())
    }

    async fn commit_software(&self, base_url: &str) -> ApiResult<()> {
        self.record("commit_software", base_url);
        let scripted = self.commit_script.lock().unwrap().pop_front();
        scripted.unwrap_or(Ok(()))
    }
}
