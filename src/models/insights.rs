//! Payload types returned by the SQ Insights partner API.
//!
//! Only fields the sync pipeline persists are modelled; everything else in
//! the upstream JSON is ignored. Optional fields stay `Option` because the
//! partner omits them freely.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `reportId` values accepted by `GET /reports`.
pub mod report_ids {
    pub const COIN_VAULT: &str = "COIN_VAULT";
    pub const AUDIT_CYCLE_USAGE: &str = "AUDIT_CYCLE_USAGE";
    pub const AUDIT_TOTAL_VENDING: &str = "AUDIT_TOTAL_VENDING";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightsLocation {
    pub id: String,
    pub name: String,
    pub timezone: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(alias = "locationStatus")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightsMachineType {
    pub name: String,
    #[serde(default)]
    pub is_washer: bool,
    #[serde(default)]
    pub is_dryer: bool,
    #[serde(default)]
    pub is_combo: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightsMachine {
    pub id: String,
    pub name: Option<String>,
    pub control_id: Option<String>,
    pub serial_number: Option<String>,
    pub model_number: Option<String>,
    pub machine_type: Option<InsightsMachineType>,
    /// Kept verbatim: door state, selected cycle, remaining time, ...
    pub status: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightsModifier {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub modifier_type: Option<String>,
    pub sort_order: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightsCycle {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub cycle_type: Option<String>,
    pub sort_order: Option<i32>,
    #[serde(default)]
    pub modifiers: Vec<InsightsModifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightsMachineError {
    /// UUID assigned upstream.
    pub id: String,
    pub error_name: String,
    pub error_type: Option<String>,
    pub error_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

/// One location block inside a report envelope. Machine entries stay raw
/// so each entry decodes (and fails) on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportLocation {
    #[serde(alias = "locationId")]
    pub id: String,
    #[serde(default)]
    pub machines: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinVaultEntry {
    #[serde(alias = "machineId")]
    pub id: String,
    pub vault_size: Option<i32>,
    pub total_coins: Option<i32>,
    pub percent_full: Option<f64>,
    pub first_received_at: Option<DateTime<Utc>>,
    pub last_received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleUsageEntry {
    #[serde(alias = "machineId")]
    pub id: String,
    pub total_cycles: Option<i32>,
    pub hot_cycles: Option<i32>,
    pub warm_cycles: Option<i32>,
    pub cold_cycles: Option<i32>,
    #[serde(default)]
    pub cycles_by_type: BTreeMap<String, i32>,
    pub first_received_at: Option<DateTime<Utc>>,
    pub last_received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalVendingEntry {
    #[serde(alias = "machineId")]
    pub id: String,
    pub total_vended: Option<i64>,
    pub coin_vended: Option<i64>,
    pub card_vended: Option<i64>,
    pub first_received_at: Option<DateTime<Utc>>,
    pub last_received_at: Option<DateTime<Utc>>,
}
