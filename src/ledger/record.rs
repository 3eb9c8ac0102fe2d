//! Ledger data model: per-repository progress records plus the pipeline state
//! field, serialized together as one JSON object.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved top-level key holding the pipeline state.
pub const STATE_KEY: &str = "__pipeline_state__";

/// Status of one repository in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    #[serde(alias = "Pending")]
    Pending,
    #[serde(alias = "InProgress", alias = "in-progress")]
    InProgress,
    #[serde(alias = "Completed")]
    Completed,
    #[serde(alias = "Error")]
    Error,
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordStatus::Pending => write!(f, "pending"),
            RecordStatus::InProgress => write!(f, "in_progress"),
            RecordStatus::Completed => write!(f, "completed"),
            RecordStatus::Error => write!(f, "error"),
        }
    }
}

/// Last known mode of the pipeline. Diagnostic only: live pause/cancel goes
/// through the run controls, never through this field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// No run has recorded a state yet.
    #[default]
    #[serde(alias = "Idle")]
    Idle,
    #[serde(alias = "Running")]
    Running,
    #[serde(alias = "Paused")]
    Paused,
    #[serde(alias = "Completed")]
    Completed,
    #[serde(alias = "Error")]
    Error,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "idle"),
            PipelineState::Running => write!(f, "running"),
            PipelineState::Paused => write!(f, "paused"),
            PipelineState::Completed => write!(f, "completed"),
            PipelineState::Error => write!(f, "error"),
        }
    }
}

/// One record per repository ever attempted, keyed by full name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RecordRepr")]
pub struct ProgressRecord {
    pub status: RecordStatus,
    /// `None` only for hand-written or migrated entries without a timestamp.
    #[serde(rename = "timestamp")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProgressRecord {
    pub fn new(status: RecordStatus, detail: Option<String>) -> Self {
        Self {
            status,
            last_updated: Some(Utc::now()),
            detail,
        }
    }
}

/// On-disk shapes accepted for a record. Older progress files stored a bare
/// completion timestamp per repository.
#[derive(Deserialize)]
#[serde(untagged)]
enum RecordRepr {
    Full {
        status: RecordStatus,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        detail: Option<String>,
    },
    Legacy(String),
}

impl From<RecordRepr> for ProgressRecord {
    fn from(repr: RecordRepr) -> Self {
        match repr {
            RecordRepr::Full {
                status,
                timestamp,
                detail,
            } => Self {
                status,
                last_updated: timestamp,
                detail,
            },
            RecordRepr::Legacy(stamp) => Self {
                status: RecordStatus::Completed,
                last_updated: parse_legacy_timestamp(&stamp),
                detail: None,
            },
        }
    }
}

fn parse_legacy_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive local stamps are taken as UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Everything persisted in the ledger file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(rename = "__pipeline_state__", default)]
    pub state: PipelineState,
    #[serde(flatten)]
    pub records: BTreeMap<String, ProgressRecord>,
}

impl Ledger {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn keys_with_status(&self, wanted: &[RecordStatus]) -> impl Iterator<Item = &String> {
        let wanted = wanted.to_vec();
        self.records
            .iter()
            .filter(move |(_, record)| wanted.contains(&record.status))
            .map(|(key, _)| key)
    }
}
