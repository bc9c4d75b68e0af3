//! Durable upgrade progress record.
//!
//! A single `checkpoint.json` lives in the work directory for the duration
//! of a run. It is overwritten at every phase transition and renamed with a
//! timestamp suffix once the whole run succeeds.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
const ARCHIVE_PREFIX: &str = "checkpoint_completed_";

/// Open key/value payload carried from record to record.
pub type CheckpointData = Map<String, Value>;

/// Phase stored in a checkpoint: a workflow step or the error sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPhase", into = "RawPhase")]
pub enum CheckpointPhase {
    Step(u8),
    Error,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawPhase {
    Number(u64),
    Text(String),
}

impl TryFrom<RawPhase> for CheckpointPhase {
    type Error = String;

    fn try_from(raw: RawPhase) -> Result<Self, String> {
        let number = match raw {
            RawPhase::Number(n) => n,
            RawPhase::Text(s) if s == "error" => return Ok(CheckpointPhase::Error),
            RawPhase::Text(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| format!("unknown checkpoint phase '{s}'"))?,
        };
        match number {
            1..=7 => Ok(CheckpointPhase::Step(number as u8)),
            _ => Err(format!("checkpoint phase {number} out of range")),
        }
    }
}

impl From<CheckpointPhase> for RawPhase {
    fn from(phase: CheckpointPhase) -> Self {
        match phase {
            CheckpointPhase::Step(n) => Self::Number(u64::from(n)),
            CheckpointPhase::Error => Self::Text("error".to_string()),
        }
    }
}

impl fmt::Display for CheckpointPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step(n) => write!(f, "{n}"),
            Self::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Starting,
    Completed,
    Skipped,
    Failed,
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub timestamp: DateTime<Utc>,
    pub phase: CheckpointPhase,
    pub status: CheckpointStatus,
    #[serde(default)]
    pub data: CheckpointData,
}

/// Owner of the live checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    /// Overwrite the live record. Write failures are logged and swallowed.
    pub fn save(&self, phase: CheckpointPhase, status: CheckpointStatus, data: &CheckpointData) {
        let record = CheckpointRecord {
            timestamp: Utc::now(),
            phase,
            status,
            data: data.clone(),
        };

        match self.write_atomic(&record) {
            Ok(()) => debug!("Checkpoint saved: phase {} {}", phase, status),
            Err(e) => warn!(
                "Failed to save checkpoint (phase {} {}) to {}: {}",
                phase,
                status,
                self.path().display(),
                e
            ),
        }
    }

    fn write_atomic(&self, record: &CheckpointRecord) -> std::io::Result<()> {
        let target = self.path();
        let tmp = self.dir.join(format!(".{CHECKPOINT_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(record)?;

        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &target)
    }

    /// Last saved record, if any. Unreadable or corrupt files count as none.
    pub fn load(&self) -> Option<CheckpointRecord> {
        let path = self.path();
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read checkpoint {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<CheckpointRecord>(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring corrupt checkpoint {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Rename the live record so later runs start fresh. No-op when none exists.
    pub fn archive(&self) -> Option<PathBuf> {
        let source = self.path();
        if !source.exists() {
            return None;
        }

        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let target = unique_archive_path(&self.dir, &stamp);

        match std::fs::rename(&source, &target) {
            Ok(()) => {
                info!("Checkpoint archived to {}", target.display());
                Some(target)
            }
            Err(e) => {
                warn!("Failed to archive checkpoint {}: {}", source.display(), e);
                None
            }
        }
    }
}

fn unique_archive_path(dir: &Path, stamp: &str) -> PathBuf {
    let base = dir.join(format!("{ARCHIVE_PREFIX}{stamp}.json"));
    if !base.exists() {
        return base;
    }
    (1..)
        .map(|n| dir.join(format!("{ARCHIVE_PREFIX}{stamp}_{n}.json")))
        .find(|p| !p.exists())
        .unwrap_or(base)
}

/// Merge `update` into `data` without touching keys that are already present.
/// Returns the keys that were rejected.
pub fn merge_append_only(data: &mut CheckpointData, update: CheckpointData) -> Vec<String> {
    let mut rejected = Vec::new();
    for (key, value) in update {
        if data.contains_key(&key) {
            rejected.push(key);
        } else {
            data.insert(key, value);
        }
    }
    rejected
}
