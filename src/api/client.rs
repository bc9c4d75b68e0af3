//! reqwest implementation of the management API.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode, header};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{ApplianceApi, ClusterStatus, SoftwareImage, UpdateStatus};
use crate::config::{Config, Credentials};
use crate::error::{ApiResult, CcupError};
use crate::license::has_plus_license;
use crate::upload::TransferStrategy;
use crate::upload::body::{FORM_FIELD, software_form};
use crate::upload::progress::TransferProgress;

const COMMIT_TIMEOUT: Duration = Duration::from_secs(300);
const CONFIG_FORM_NAME: &str = "DefenseFlow-To-CCPlus.code-workspace";

/// Management API client shared by both nodes.
///
/// One cookie jar holds the session of each controller, keyed by host, so
/// a login to the primary never invalidates the secondary session.
#[derive(Clone)]
pub struct HttpApplianceClient {
    client: Client,
    upload_timeout: Duration,
}

impl HttpApplianceClient {
    pub fn new(config: &Config) -> Result<Self> {
        Self::build(config.verify_tls, config.request_timeout, config.upload_timeout)
    }

    pub fn build(verify_tls: bool, request_timeout: Duration, upload_timeout: Duration) -> Result<Self> {
        if !verify_tls {
            debug!("TLS certificate verification disabled");
        }

        let client = Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(!verify_tls)
            .connect_timeout(Duration::from_secs(30))
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            upload_timeout,
        })
    }

    fn url(base_url: &str, path: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), path)
    }

    /// Map a non-success status to an error, keeping the body for context.
    async fn check_status(endpoint: &str, response: Response) -> ApiResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(CcupError::from_status(endpoint, status.as_u16(), body))
    }

    async fn read_json<T: DeserializeOwned>(endpoint: &str, response: Response) -> ApiResult<T> {
        let text = response
            .text()
            .await
            .map_err(|e| CcupError::http(endpoint, e))?;
        if text.trim().is_empty() {
            return Err(CcupError::EmptyResponse(endpoint.to_string()));
        }
        serde_json::from_str(&text).map_err(|e| CcupError::Decode(endpoint.to_string(), e.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str, url: String) -> ApiResult<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CcupError::http(endpoint, e))?;
        let response = Self::check_status(endpoint, response).await?;
        Self::read_json(endpoint, response).await
    }

    async fn protected_object_names(&self, base_url: &str) -> ApiResult<Vec<String>> {
        const EP: &str = "protected_objects.list";
        let url = Self::url(
            base_url,
            "/mgmt/v2/device/df/restv2/protected-objects/configure/security-settings/?includeNameSort=false",
        );
        let response = self
            .client
            .post(url)
            .json(&json!({ "protectedObjectNames": [] }))
            .send()
            .await
            .map_err(|e| CcupError::http(EP, e))?;
        let response = Self::check_status(EP, response).await?;
        let body: Value = Self::read_json(EP, response).await?;
        Ok(names_under(&body, "protectedObjects"))
    }
}

/// Collect the `name` of every object in the array at `key`.
fn names_under(body: &Value, key: &str) -> Vec<String> {
    body.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Filename from a `Content-Disposition` header, stripped of any directory part.
fn disposition_filename(value: &str) -> Option<String> {
    let raw = value.split("filename=").nth(1)?;
    let raw = raw.split(';').next()?.trim().trim_matches('"');
    let name = Path::new(raw).file_name()?.to_string_lossy().into_owned();
    (!name.is_empty()).then_some(name)
}

fn default_config_filename() -> String {
    format!("DefenseFlowConfiguration_{}.zip", Local::now().format("%Y%m%d_%H%M%S"))
}

#[async_trait]
impl ApplianceApi for HttpApplianceClient {
    async fn login(&self, base_url: &str, credentials: &Credentials) -> ApiResult<bool> {
        const EP: &str = "user.login";
        let response = self
            .client
            .post(Self::url(base_url, "/mgmt/system/user/login"))
            .json(&json!({
                "username": credentials.username,
                "password": credentials.password(),
            }))
            .send()
            .await
            .map_err(|e| CcupError::http(EP, e))?;

        let status = response.status();
        if status == StatusCode::OK {
            debug!(base_url, user = %credentials.username, "Login succeeded");
            Ok(true)
        } else {
            warn!(base_url, status = status.as_u16(), "Login rejected");
            Ok(false)
        }
    }

    async fn break_cluster(&self, base_url: &str) -> ApiResult<()> {
        const EP: &str = "ha.break";
        let response = self
            .client
            .delete(Self::url(base_url, "/mgmt/cybercontroller/ha/config"))
            .send()
            .await
            .map_err(|e| CcupError::http(EP, e))?;

        if response.status() != StatusCode::OK {
            warn!(
                base_url,
                status = response.status().as_u16(),
                "Break HA request not accepted, checking cluster state"
            );
        }
        Ok(())
    }

    async fn cluster_status(&self, base_url: &str) -> ApiResult<ClusterStatus> {
        self.get_json("ha.status", Self::url(base_url, "/mgmt/cybercontroller/ha/status"))
            .await
    }

    async fn router_id(&self, base_url: &str) -> ApiResult<Option<String>> {
        let body: Value = self
            .get_json(
                "df.router_id",
                Self::url(base_url, "/mgmt/device/df/config?prop=BGP_ROUTER_ID,BGP_HOLD_TIME,BGP_LOCAL_AS"),
            )
            .await?;

        Ok(body
            .get("BGP_ROUTER_ID")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string))
    }

    async fn network_element_names(&self, base_url: &str) -> ApiResult<Vec<String>> {
        let body: Value = self
            .get_json(
                "df.network_elements",
                Self::url(base_url, "/mgmt/device/df/config/NetworkElements?count=100"),
            )
            .await?;
        Ok(names_under(&body, "NetworkElements"))
    }

    async fn update_network_element_router_id(
        &self,
        base_url: &str,
        name: &str,
        router_id: &str,
    ) -> ApiResult<()> {
        const EP: &str = "df.network_element.update";
        let response = self
            .client
            .put(Self::url(base_url, &format!("/mgmt/device/df/config/NetworkElements/{name}/")))
            .json(&json!({ "name": name, "RouterID": router_id }))
            .send()
            .await
            .map_err(|e| CcupError::http(EP, e))?;
        Self::check_status(EP, response).await?;
        Ok(())
    }

    async fn disable_protected_objects(&self, base_url: &str) -> ApiResult<usize> {
        const EP: &str = "protected_objects.disable";
        let names = self.protected_object_names(base_url).await?;
        if names.is_empty() {
            info!("No protected objects found on {}", base_url);
            return Ok(0);
        }

        let url = Self::url(base_url, "/mgmt/v2/device/df/restv2/protected-objects/configure/?action=disable");
        let mut disabled = 0;
        for name in &names {
            let response = self
                .client
                .put(&url)
                .json(&json!([name]))
                .send()
                .await
                .map_err(|e| CcupError::http(EP, e))?;
            match Self::check_status(EP, response).await {
                Ok(_) => {
                    debug!(protected_object = %name, "Disabled protected object");
                    disabled += 1;
                }
                Err(e) => warn!("Failed to disable protected object {}: {}", name, e),
            }
        }
        Ok(disabled)
    }

    async fn establish_cluster(
        &self,
        base_url: &str,
        primary_address: &str,
        secondary_address: &str,
        secondary_credentials: &Credentials,
    ) -> ApiResult<()> {
        const EP: &str = "ha.establish";
        let response = self
            .client
            .post(Self::url(base_url, "/mgmt/cybercontroller/ha/config"))
            .json(&json!({
                "primaryIP": primary_address,
                "secondaryIP": secondary_address,
                "virtualIP": "",
                "autoFailover": true,
                "secondary": {
                    "user": secondary_credentials.username,
                    "password": secondary_credentials.password(),
                },
            }))
            .send()
            .await
            .map_err(|e| CcupError::http(EP, e))?;

        if response.status() != StatusCode::OK {
            warn!(
                base_url,
                status = response.status().as_u16(),
                "Establish HA request not accepted, waiting for cluster health"
            );
        }
        Ok(())
    }

    async fn download_config(&self, base_url: &str, dest_dir: &Path) -> ApiResult<PathBuf> {
        const EP: &str = "df.config.export";
        let response = self
            .client
            .get(Self::url(base_url, "/mgmt/device/df/config/getfromdevice?saveToDb=false&type=config"))
            .timeout(self.upload_timeout)
            .send()
            .await
            .map_err(|e| CcupError::http(EP, e))?;
        let response = Self::check_status(EP, response).await?;

        let filename = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename)
            .unwrap_or_else(|| {
                let name = default_config_filename();
                info!("No filename in export response, using {}", name);
                name
            });
        let path = dest_dir.join(filename);

        let io_err = |e: std::io::Error| CcupError::LocalIo(format!("{}: {}", path.display(), e));
        let mut file = tokio::fs::File::create(&path).await.map_err(io_err)?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CcupError::http(EP, e))?;
            file.write_all(&chunk).await.map_err(io_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;

        info!("Exported configuration to {} ({} bytes)", path.display(), written);
        Ok(path)
    }

    async fn upload_config(&self, base_url: &str, file: &Path) -> ApiResult<()> {
        const EP: &str = "df.config.import";
        let bytes = tokio::fs::read(file).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CcupError::FileNotFound(file.to_path_buf())
            } else {
                CcupError::LocalIo(format!("{}: {}", file.display(), e))
            }
        })?;
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let part = Part::bytes(bytes)
            .file_name(CONFIG_FORM_NAME)
            .mime_str("application/octet-stream")
            .map_err(|e| CcupError::http(EP, e))?;
        let response = self
            .client
            .post(Self::url(base_url, "/mgmt/device/df/config/sendtodevice"))
            .query(&[("fileName", file_name.as_str()), ("type", "config")])
            .timeout(self.upload_timeout)
            .multipart(Form::new().part(FORM_FIELD, part))
            .send()
            .await
            .map_err(|e| CcupError::http(EP, e))?;
        let response = Self::check_status(EP, response).await?;

        let body: Value = Self::read_json(EP, response).await?;
        match body.get("status").and_then(Value::as_str) {
            Some(status) if status != "ok" => {
                let message = body.get("message").and_then(Value::as_str).unwrap_or(status);
                Err(CcupError::Http {
                    endpoint: EP.to_string(),
                    status: 200,
                    body: message.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    async fn check_license(&self, base_url: &str) -> ApiResult<bool> {
        let body: Value = self
            .get_json(
                "system.license",
                Self::url(base_url, "/mgmt/system/config/itemlist/licenseinfo"),
            )
            .await?;
        Ok(has_plus_license(&body, Local::now().date_naive()))
    }

    async fn update_status(&self, base_url: &str) -> ApiResult<UpdateStatus> {
        self.get_json(
            "system.update_status",
            Self::url(base_url, "/mgmt/system/config/item/settingsbaseparams"),
        )
        .await
    }

    async fn send_software(
        &self,
        base_url: &str,
        image: &SoftwareImage,
        strategy: TransferStrategy,
        progress: Arc<TransferProgress>,
    ) -> ApiResult<()> {
        const EP: &str = "software.upload";
        let form = software_form(image, strategy, progress.clone()).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CcupError::FileNotFound(image.path.clone())
            } else {
                CcupError::LocalIo(format!("{}: {}", image.path.display(), e))
            }
        })?;

        let response = self
            .client
            .post(Self::url(base_url, "/mgmt/system/config/action/software"))
            .query(&[("type", "full".to_string()), ("filesize", image.size.to_string())])
            .timeout(self.upload_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| CcupError::http(EP, e))?;
        Self::check_status(EP, response).await?;
        if strategy == TransferStrategy::Buffered {
            progress.record(image.size);
        }
        Ok(())
    }

    async fn commit_software(&self, base_url: &str) -> ApiResult<()> {
        const EP: &str = "software.commit";
        let response = self
            .client
            .put(Self::url(base_url, "/mgmt/system/config/action/software"))
            .query(&[("type", "full")])
            .timeout(COMMIT_TIMEOUT)
            .send()
            .await
            .map_err(|e| CcupError::http(EP, e))?;
        Self::check_status(EP, response).await?;
        Ok(())
    }
}
