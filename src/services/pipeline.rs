//! Stage outcomes shared by the resource synchronizers.
//!
//! Each item flows `fetch → validate → resolve-refs → upsert`. A stage that
//! cannot continue yields a [`SkipReason`] value; orchestrators fold those
//! into a [`SyncReport`] instead of aborting the run.

use core::fmt;
use log::warn;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Resource {
    Campus,
    Location,
    MachineType,
    Machine,
    MachineProgram,
    ProgramModifier,
    MachineError,
    CoinVault,
    AuditCycleUsage,
    AuditTotalVending,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Resource::Campus => "campus",
            Resource::Location => "location",
            Resource::MachineType => "machine type",
            Resource::Machine => "machine",
            Resource::MachineProgram => "machine program",
            Resource::ProgramModifier => "program modifier",
            Resource::MachineError => "machine error",
            Resource::CoinVault => "coin vault report",
            Resource::AuditCycleUsage => "audit cycle usage report",
            Resource::AuditTotalVending => "audit total vending report",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SkipReason {
    #[error("{resource} response has no `{expected}`")]
    MissingEnvelope { resource: Resource, expected: String },
    #[error("{resource} item malformed at {path}: {detail}")]
    Malformed {
        resource: Resource,
        path: String,
        detail: String,
    },
    #[error("{resource} {key} references unknown {parent} {parent_key}")]
    #[serde(rename_all = "camelCase")]
    MissingParent {
        resource: Resource,
        key: String,
        parent: Resource,
        parent_key: String,
    },
    #[error("{resource} {key} failed: {detail}")]
    Failed {
        resource: Resource,
        key: String,
        detail: String,
    },
}

impl SkipReason {
    pub fn failed(resource: Resource, key: &str, err: impl fmt::Display) -> Self {
        SkipReason::Failed {
            resource,
            key: key.to_string(),
            detail: err.to_string(),
        }
    }

    pub fn missing_parent(resource: Resource, key: &str, parent: Resource, parent_key: &str) -> Self {
        SkipReason::MissingParent {
            resource,
            key: key.to_string(),
            parent,
            parent_key: parent_key.to_string(),
        }
    }
}

/// Outcome of one orchestrated run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub counts: BTreeMap<Resource, usize>,
    pub skipped: Vec<SkipReason>,
    pub duration_ms: u64,
}

impl SyncReport {
    pub fn tally(&mut self, resource: Resource) {
        *self.counts.entry(resource).or_default() += 1;
    }

    pub fn count(&self, resource: Resource) -> usize {
        self.counts.get(&resource).copied().unwrap_or(0)
    }

    pub fn skip(&mut self, reason: SkipReason) {
        warn!("Sync: skipped {}", reason);
        self.skipped.push(reason);
    }
}

/// Walk `path` from the payload root and require an array there.
pub fn envelope_items<'a>(payload: &'a Value, resource: Resource, path: &[&str]) -> Result<&'a [Value], SkipReason> {
    let mut node = payload;
    for segment in path {
        node = node.get(segment).ok_or_else(|| missing(resource, path))?;
    }
    node.as_array().map(Vec::as_slice).ok_or_else(|| missing(resource, path))
}

fn missing(resource: Resource, path: &[&str]) -> SkipReason {
    SkipReason::MissingEnvelope {
        resource,
        expected: format!("{}[]", path.join(".")),
    }
}

/// Decode one item, reporting the JSON path that failed.
pub fn decode<T: DeserializeOwned>(item: &Value, resource: Resource) -> Result<T, SkipReason> {
    serde_path_to_error::deserialize(item).map_err(|e| SkipReason::Malformed {
        resource,
        path: e.path().to_string(),
        detail: e.inner().to_string(),
    })
}
