//! Durable migration state: which (record, role) pairs are finished, the upload
//! timestamp ledger backing the sliding-window quota, and terminal failures.

mod handle;
mod store;

pub use handle::{ProgressHandle, SlotDecision};
pub use store::{CheckpointStore, JsonFileStore, MemoryStore};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Marker role written for checkpoints that only tracked record ids.
const ALL_ROLES: &str = "*";

/// Persisted shape of a migration; one file per configured pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    #[serde(default)]
    pub total_records: usize,
    #[serde(default)]
    pub processed_records: ProcessedRecords,
    #[serde(default)]
    pub upload_timestamps: Vec<i64>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
}

impl MigrationProgress {
    /// Most recent `limit` errors, oldest first.
    pub fn recent_errors(&self, limit: usize) -> &[ErrorEntry] {
        let start = self.errors.len().saturating_sub(limit);
        &self.errors[start..]
    }
}

/// record id -> role -> done.
///
/// Serialized as a map. Older single-field checkpoints stored a plain list of
/// ids; those load as "every role done" for the listed records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedRecords(BTreeMap<String, BTreeMap<String, bool>>);

impl ProcessedRecords {
    pub fn is_done(&self, record_id: &str, role: &str) -> bool {
        self.0
            .get(record_id)
            .map(|roles| {
                roles.get(ALL_ROLES).copied().unwrap_or(false)
                    || roles.get(role).copied().unwrap_or(false)
            })
            .unwrap_or(false)
    }

    pub fn mark(&mut self, record_id: &str, role: &str) {
        self.0
            .entry(record_id.to_string())
            .or_default()
            .insert(role.to_string(), true);
    }

    pub fn contains_record(&self, record_id: &str) -> bool {
        self.0
            .get(record_id)
            .map(|roles| roles.values().any(|done| *done))
            .unwrap_or(false)
    }

    pub fn record_ids(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(_, roles)| roles.values().any(|done| *done))
            .map(|(id, _)| id.as_str())
    }

    /// Number of records with at least one finished role.
    pub fn len(&self) -> usize {
        self.record_ids().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Manual re-queue; the only path that shrinks the set.
    pub fn remove(&mut self, record_id: &str) -> bool {
        self.0.remove(record_id).is_some()
    }
}

impl Serialize for ProcessedRecords {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ProcessedRecords {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Ids(BTreeSet<String>),
            Roles(BTreeMap<String, BTreeMap<String, bool>>),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Ids(ids) => ProcessedRecords(
                ids.into_iter()
                    .map(|id| (id, BTreeMap::from([(ALL_ROLES.to_string(), true)])))
                    .collect(),
            ),
            Repr::Roles(map) => ProcessedRecords(map),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimitExceeded,
    #[default]
    Upload,
    PatchConflict,
}

/// One terminal per-record failure. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub record_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub kind: ErrorKind,
    pub error: String,
    /// Set when an upload succeeded but the record could not be patched; the hosted
    /// copy is orphaned and this is what an operator needs to reconcile it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted_url: Option<String>,
    pub timestamp: i64,
}
