//! Diesel model structs for fleet entities and the sync audit log.
//!
//! Entity structs double as insert rows and select targets: the surrogate
//! `id` and the `created_at`/`last_sync_at` bookkeeping columns are owned by
//! the database and surface through [`Stored`] instead.

use chrono::{DateTime, Utc};
use core::fmt;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::schema;
use crate::utils::truncate_chars;

/// Upper bound for the response body excerpt kept on API call log rows.
pub const RESPONSE_EXCERPT_CHARS: usize = 1000;

/// What an upsert does when a row with the same natural key already exists.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// Overwrite the stored fields and bump `last_sync_at`.
    Update,
    /// Keep the stored row untouched.
    Ignore,
}

/// A persisted record that the sync pipeline upserts by a natural key.
pub trait Entity: Clone + Send + Sync + 'static {
    const TABLE: &'static str;
    const CONFLICT: Conflict;

    /// External ID from the partner API, or the key column for entities
    /// that have none (campus slug, machine type name, snapshot pair).
    fn natural_key(&self) -> String;
}

/// An entity as read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stored<E> {
    pub id: i64,
    #[serde(flatten)]
    pub record: E,
    pub created_at: DateTime<Utc>,
    pub last_sync_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::campuses)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct Campus {
    pub slug: String,
    pub name: String,
}

impl Entity for Campus {
    const TABLE: &'static str = "campuses";
    const CONFLICT: Conflict = Conflict::Update;

    fn natural_key(&self) -> String {
        self.slug.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Insertable, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::locations)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub external_id: String,
    pub name: String,
    pub timezone: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: Option<String>,
    pub campus_id: Option<i64>,
}

impl Entity for Location {
    const TABLE: &'static str = "locations";
    const CONFLICT: Conflict = Conflict::Update;

    fn natural_key(&self) -> String {
        self.external_id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Insertable, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::machine_types)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct MachineType {
    pub name: String,
    pub is_washer: bool,
    pub is_dryer: bool,
    pub is_combo: bool,
    pub description: Option<String>,
}

impl Entity for MachineType {
    const TABLE: &'static str = "machine_types";
    const CONFLICT: Conflict = Conflict::Update;

    // Machine types carry no upstream ID and are shared between machines.
    fn natural_key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Insertable, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::machines)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub external_id: String,
    pub name: Option<String>,
    pub location_id: i64,
    pub machine_type_id: Option<i64>,
    pub control_id: Option<String>,
    pub serial_number: Option<String>,
    pub model_number: Option<String>,
    /// Raw status blob (door state, selected cycle, remaining time, ...).
    pub status: Option<serde_json::Value>,
}

impl Entity for Machine {
    const TABLE: &'static str = "machines";
    const CONFLICT: Conflict = Conflict::Update;

    fn natural_key(&self) -> String {
        self.external_id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Insertable, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::machine_programs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct MachineProgram {
    pub external_id: String,
    pub name: String,
    pub program_type: Option<String>,
    pub sort_order: Option<i32>,
    pub machine_type_id: Option<i64>,
    pub machine_id: Option<i64>,
}

impl Entity for MachineProgram {
    const TABLE: &'static str = "machine_programs";
    const CONFLICT: Conflict = Conflict::Update;

    fn natural_key(&self) -> String {
        self.external_id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Insertable, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::program_modifiers)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct ProgramModifier {
    pub external_id: String,
    pub name: String,
    pub modifier_type: Option<String>,
    pub sort_order: Option<i32>,
    pub program_id: Option<i64>,
    pub machine_type_id: Option<i64>,
    pub machine_id: Option<i64>,
}

impl Entity for ProgramModifier {
    const TABLE: &'static str = "program_modifiers";
    const CONFLICT: Conflict = Conflict::Update;

    fn natural_key(&self) -> String {
        self.external_id.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Insertable, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::machine_errors)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct MachineError {
    /// Upstream UUID.
    pub external_id: String,
    pub machine_id: i64,
    pub location_id: i64,
    pub error_name: String,
    pub error_type: Option<String>,
    pub error_code: Option<i32>,
    pub occurred_at: DateTime<Utc>,
}

impl Entity for MachineError {
    const TABLE: &'static str = "machine_errors";
    // errors are immutable once recorded
    const CONFLICT: Conflict = Conflict::Ignore;

    fn natural_key(&self) -> String {
        self.external_id.clone()
    }
}

fn snapshot_key(location_id: i64, machine_id: i64) -> String {
    format!("{location_id}:{machine_id}")
}

#[derive(Debug, Clone, PartialEq, Insertable, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::coin_vaults)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct CoinVault {
    pub location_id: i64,
    pub machine_id: i64,
    pub vault_size: Option<i32>,
    pub total_coins: Option<i32>,
    pub percent_full: Option<f64>,
    pub first_received_at: Option<DateTime<Utc>>,
    pub last_received_at: Option<DateTime<Utc>>,
}

impl Entity for CoinVault {
    const TABLE: &'static str = "coin_vaults";
    const CONFLICT: Conflict = Conflict::Update;

    fn natural_key(&self) -> String {
        snapshot_key(self.location_id, self.machine_id)
    }
}

#[derive(Debug, Clone, PartialEq, Insertable, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::audit_cycle_usage)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct AuditCycleUsage {
    pub location_id: i64,
    pub machine_id: i64,
    pub total_cycles: Option<i32>,
    pub hot_cycles: Option<i32>,
    pub warm_cycles: Option<i32>,
    pub cold_cycles: Option<i32>,
    pub cycles_by_type: Option<serde_json::Value>,
    pub first_received_at: Option<DateTime<Utc>>,
    pub last_received_at: Option<DateTime<Utc>>,
}

impl Entity for AuditCycleUsage {
    const TABLE: &'static str = "audit_cycle_usage";
    const CONFLICT: Conflict = Conflict::Update;

    fn natural_key(&self) -> String {
        snapshot_key(self.location_id, self.machine_id)
    }
}

#[derive(Debug, Clone, PartialEq, Insertable, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::audit_total_vending)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct AuditTotalVending {
    pub location_id: i64,
    pub machine_id: i64,
    pub total_vended_cents: Option<i64>,
    pub coin_vended_cents: Option<i64>,
    pub card_vended_cents: Option<i64>,
    pub first_received_at: Option<DateTime<Utc>>,
    pub last_received_at: Option<DateTime<Utc>>,
}

impl Entity for AuditTotalVending {
    const TABLE: &'static str = "audit_total_vending";
    const CONFLICT: Conflict = Conflict::Update;

    fn natural_key(&self) -> String {
        snapshot_key(self.location_id, self.machine_id)
    }
}

/// Why a sync run was started.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    /// The run fired when the scheduler started.
    Auto,
    /// Triggered through the API or the CLI.
    Manual,
    /// A timer tick of the scheduler.
    Scheduled,
}

impl SyncType {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncType::Auto => "auto",
            SyncType::Manual => "manual",
            SyncType::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(SyncType::Auto),
            "manual" => Ok(SyncType::Manual),
            "scheduled" => Ok(SyncType::Scheduled),
            other => Err(format!("unknown sync type: {other}")),
        }
    }
}

/// Attribution carried through a sync run onto every log row it writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub sync_type: SyncType,
    pub user_id: Option<String>,
}

impl RunContext {
    pub fn new(sync_type: SyncType) -> Self {
        RunContext {
            sync_type,
            user_id: None,
        }
    }

    pub fn manual(user_id: Option<String>) -> Self {
        RunContext {
            sync_type: SyncType::Manual,
            user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = schema::sync_logs)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[serde(rename_all = "camelCase")]
pub struct SyncLog {
    pub id: i64,
    pub endpoint: String,
    pub method: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub duration_ms: i64,
    pub status_code: Option<i32>,
    pub response_excerpt: Option<String>,
    pub location_count: i32,
    pub machine_count: i32,
    pub program_count: i32,
    pub user_id: Option<String>,
    pub sync_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = schema::sync_logs)]
pub struct NewSyncLog {
    pub endpoint: String,
    pub method: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub duration_ms: i64,
    pub status_code: Option<i32>,
    pub response_excerpt: Option<String>,
    pub location_count: i32,
    pub machine_count: i32,
    pub program_count: i32,
    pub user_id: Option<String>,
    pub sync_type: String,
}

impl NewSyncLog {
    /// Log row for one partner API call.
    pub fn api_call(
        run: &RunContext,
        endpoint: &str,
        elapsed: Duration,
        status_code: Option<u16>,
        body: Option<&str>,
        error: Option<String>,
    ) -> Self {
        NewSyncLog {
            endpoint: endpoint.to_string(),
            method: "GET".to_string(),
            success: error.is_none(),
            error_message: error,
            duration_ms: millis(elapsed),
            status_code: status_code.map(i32::from),
            response_excerpt: body.map(|b| truncate_chars(b, RESPONSE_EXCERPT_CHARS)),
            location_count: 0,
            machine_count: 0,
            program_count: 0,
            user_id: run.user_id.clone(),
            sync_type: run.sync_type.as_str().to_string(),
        }
    }

    /// Summary row for a whole orchestrated run.
    pub fn run_summary(run: &RunContext, label: &str, elapsed: Duration, error: Option<String>) -> Self {
        NewSyncLog {
            endpoint: label.to_string(),
            method: "SYNC".to_string(),
            success: error.is_none(),
            error_message: error,
            duration_ms: millis(elapsed),
            status_code: None,
            response_excerpt: None,
            location_count: 0,
            machine_count: 0,
            program_count: 0,
            user_id: run.user_id.clone(),
            sync_type: run.sync_type.as_str().to_string(),
        }
    }

    pub fn with_counts(mut self, locations: usize, machines: usize, programs: usize) -> Self {
        self.location_count = clamp_count(locations);
        self.machine_count = clamp_count(machines);
        self.program_count = clamp_count(programs);
        self
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn clamp_count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Filter for listing sync logs; `None` fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct SyncLogFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub sync_type: Option<SyncType>,
    pub success: Option<bool>,
    pub limit: Option<i64>,
}

impl SyncLogFilter {
    pub fn matches(&self, log: &SyncLog) -> bool {
        self.from.is_none_or(|from| log.created_at >= from)
            && self.to.is_none_or(|to| log.created_at <= to)
            && self.sync_type.is_none_or(|t| log.sync_type == t.as_str())
            && self.success.is_none_or(|s| log.success == s)
    }
}

/// Filter for listing machine errors by occurrence time and machine.
#[derive(Debug, Clone, Default)]
pub struct MachineErrorFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub machine_id: Option<i64>,
}

impl MachineErrorFilter {
    pub fn matches(&self, error: &MachineError) -> bool {
        self.from.is_none_or(|from| error.occurred_at >= from)
            && self.to.is_none_or(|to| error.occurred_at <= to)
            && self.machine_id.is_none_or(|m| error.machine_id == m)
    }
}
