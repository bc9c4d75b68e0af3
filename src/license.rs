//! CyberController Plus license gate.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde_json::Value;
use tracing::{info, warn};

use crate::api::ApplianceApi;
use crate::config::NodeConfig;
use crate::error::CcupError;

const PLUS_MARKER: &str = "cybercontroller plus";

/// Whether configuration migration may run. Computed once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LicenseVerdict(bool);

impl LicenseVerdict {
    pub const fn new(eligible: bool) -> Self {
        Self(eligible)
    }

    pub const fn eligible(self) -> bool {
        self.0
    }
}

pub struct LicenseGate;

impl LicenseGate {
    /// Log in to the primary and read its license inventory.
    pub async fn evaluate<A>(api: &A, primary: &NodeConfig) -> Result<LicenseVerdict>
    where
        A: ApplianceApi + ?Sized,
    {
        let base_url = primary.base_url();
        if !api.login(&base_url, &primary.credentials).await? {
            return Err(CcupError::Authentication(primary.to_string()))
                .context("Failed to log in to primary controller for license check");
        }

        let valid = api
            .check_license(&base_url)
            .await
            .context("Failed to read license information from primary controller")?;

        if valid {
            info!("Valid CyberController Plus license found");
        } else {
            warn!("Invalid or missing CyberController Plus license, configuration migration will be skipped");
        }
        Ok(LicenseVerdict::new(valid))
    }
}

/// True when the license inventory holds a CyberController Plus entry that
/// has not expired on `today`.
///
/// The inventory is either a bare array or an object with the array under
/// any key; entries are matched on any string field naming the product.
pub fn has_plus_license(inventory: &Value, today: NaiveDate) -> bool {
    entries(inventory)
        .into_iter()
        .any(|entry| names_plus(entry) && !is_expired(entry, today))
}

fn entries(inventory: &Value) -> Vec<&Value> {
    match inventory {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => map
            .values()
            .filter_map(Value::as_array)
            .flatten()
            .collect(),
        _ => Vec::new(),
    }
}

fn names_plus(entry: &Value) -> bool {
    entry
        .as_object()
        .is_some_and(|map| {
            map.values()
                .filter_map(Value::as_str)
                .any(|s| s.to_lowercase().contains(PLUS_MARKER))
        })
}

fn is_expired(entry: &Value, today: NaiveDate) -> bool {
    if entry.get("expired").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    if entry.get("valid").and_then(Value::as_bool) == Some(false) {
        return true;
    }
    let status = entry
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_lowercase);
    if matches!(status.as_deref(), Some("expired" | "invalid")) {
        return true;
    }

    ["expirationDate", "expiryDate", "expiration"]
        .iter()
        .filter_map(|key| entry.get(*key).and_then(Value::as_str))
        .filter_map(|s| s.get(..10))
        .filter_map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        .any(|expiry| expiry < today)
}
