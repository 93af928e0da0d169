use axum::Json;
use axum::extract::{Query, State};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::api::{AppState, ApiError};
use crate::client::Transport;
use crate::db::models::{
    Entity, Machine, MachineError, MachineErrorFilter, RunContext, Stored, SyncLog, SyncLogFilter, SyncType,
};
use crate::db::store::{EntityStore, Storage};
use crate::services::persistent::{self, PersistentError};
use crate::services::pipeline::SyncReport;
use crate::services::scheduler::SchedulerStatus;
use crate::services::sync::{SyncError, SyncService};

const USER_ID_HEADER: &str = "x-user-id";
const DEFAULT_LOG_LIMIT: i64 = 100;
const MAX_LOG_LIMIT: i64 = 1000;

async fn blocking<R, F>(f: F) -> Result<R, ApiError>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Task(e.to_string()))?
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

async fn run_sync<S, T, F>(state: AppState<S, T>, headers: HeaderMap, f: F) -> Result<Json<SyncReport>, ApiError>
where
    S: Storage,
    T: Transport,
    F: FnOnce(&SyncService<S, T>, &RunContext) -> Result<SyncReport, SyncError> + Send + 'static,
{
    let sync = state.sync.ok_or(ApiError::SyncDisabled)?;
    let run = RunContext::manual(user_id(&headers));
    let report = blocking(move || f(&*sync, &run).map_err(ApiError::from)).await?;
    Ok(Json(report))
}

pub async fn sync_all<S: Storage, T: Transport>(
    State(state): State<AppState<S, T>>,
    headers: HeaderMap,
) -> Result<Json<SyncReport>, ApiError> {
    run_sync(state, headers, |s, run| s.sync_all(run)).await
}

pub async fn sync_locations<S: Storage, T: Transport>(
    State(state): State<AppState<S, T>>,
    headers: HeaderMap,
) -> Result<Json<SyncReport>, ApiError> {
    run_sync(state, headers, |s, run| s.trigger_locations(run)).await
}

pub async fn sync_machines<S: Storage, T: Transport>(
    State(state): State<AppState<S, T>>,
    headers: HeaderMap,
) -> Result<Json<SyncReport>, ApiError> {
    run_sync(state, headers, |s, run| s.trigger_machines(run)).await
}

pub async fn sync_machine_errors<S: Storage, T: Transport>(
    State(state): State<AppState<S, T>>,
    headers: HeaderMap,
) -> Result<Json<SyncReport>, ApiError> {
    run_sync(state, headers, |s, run| s.trigger_machine_errors(run)).await
}

/// `fromDate`/`toDate` take RFC 3339 or a bare `YYYY-MM-DD`; a bare `toDate`
/// covers the whole day.
fn parse_date(name: &str, raw: &str, end_of_day: bool) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let bad = || ApiError::BadRequest(format!("{name}: expected RFC 3339 or YYYY-MM-DD, got {raw:?}"));
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| bad())?;
    let (h, m, s) = if end_of_day { (23, 59, 59) } else { (0, 0, 0) };
    date.and_hms_opt(h, m, s).map(|dt| dt.and_utc()).ok_or_else(bad)
}

fn parse_range(from: Option<&str>, to: Option<&str>) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), ApiError> {
    let from = from.map(|raw| parse_date("fromDate", raw, false)).transpose()?;
    let to = to.map(|raw| parse_date("toDate", raw, true)).transpose()?;
    if let (Some(f), Some(t)) = (from, to)
        && f > t
    {
        return Err(ApiError::BadRequest("fromDate is after toDate".to_string()));
    }
    Ok((from, to))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogQuery {
    from_date: Option<String>,
    to_date: Option<String>,
    sync_type: Option<String>,
    status: Option<String>,
    limit: Option<i64>,
}

impl SyncLogQuery {
    fn into_filter(self) -> Result<SyncLogFilter, ApiError> {
        let (from, to) = parse_range(self.from_date.as_deref(), self.to_date.as_deref())?;
        let sync_type = self
            .sync_type
            .as_deref()
            .map(str::parse::<SyncType>)
            .transpose()
            .map_err(ApiError::BadRequest)?;
        let success = match self.status.as_deref() {
            None => None,
            Some("success") => Some(true),
            Some("failed") => Some(false),
            Some(other) => {
                return Err(ApiError::BadRequest(format!(
                    "status: expected success or failed, got {other:?}"
                )));
            }
        };
        let limit = match self.limit {
            None => DEFAULT_LOG_LIMIT,
            Some(n) if (1..=MAX_LOG_LIMIT).contains(&n) => n,
            Some(n) => return Err(ApiError::BadRequest(format!("limit: must be 1..={MAX_LOG_LIMIT}, got {n}"))),
        };
        Ok(SyncLogFilter {
            from,
            to,
            sync_type,
            success,
            limit: Some(limit),
        })
    }
}

pub async fn sync_logs<S: Storage, T: Transport>(
    State(state): State<AppState<S, T>>,
    Query(query): Query<SyncLogQuery>,
) -> Result<Json<Vec<SyncLog>>, ApiError> {
    let filter = query.into_filter()?;
    let logs = blocking(move || Ok(state.storage.list_sync_logs(&filter)?)).await?;
    Ok(Json(logs))
}

pub async fn scheduler_status<S: Storage, T: Transport>(
    State(state): State<AppState<S, T>>,
) -> Result<Json<SchedulerStatus>, ApiError> {
    let scheduler = state.scheduler.ok_or(ApiError::SyncDisabled)?;
    let status = scheduler
        .lock()
        .map_err(|_| ApiError::Task("scheduler lock poisoned".to_string()))?
        .status();
    Ok(Json(status))
}

pub async fn list_entities<S, T, E>(State(state): State<AppState<S, T>>) -> Result<Json<Vec<Stored<E>>>, ApiError>
where
    S: Storage + EntityStore<E>,
    T: Transport,
    E: Entity + Serialize,
{
    let rows = blocking(move || Ok(EntityStore::<E>::list(&*state.storage)?)).await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineQuery {
    location_id: Option<i64>,
}

pub async fn list_machines<S: Storage, T: Transport>(
    State(state): State<AppState<S, T>>,
    Query(query): Query<MachineQuery>,
) -> Result<Json<Vec<Stored<Machine>>>, ApiError> {
    let rows = blocking(move || Ok(EntityStore::<Machine>::list(&*state.storage)?)).await?;
    let rows = rows
        .into_iter()
        .filter(|m| query.location_id.is_none_or(|id| m.record.location_id == id))
        .collect();
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineErrorQuery {
    from_date: Option<String>,
    to_date: Option<String>,
    machine_id: Option<i64>,
}

pub async fn machine_errors<S: Storage, T: Transport>(
    State(state): State<AppState<S, T>>,
    Query(query): Query<MachineErrorQuery>,
) -> Result<Json<Vec<Stored<MachineError>>>, ApiError> {
    let (from, to) = parse_range(query.from_date.as_deref(), query.to_date.as_deref())?;
    let filter = MachineErrorFilter {
        from,
        to,
        machine_id: query.machine_id,
    };
    let rows = blocking(move || Ok(state.storage.machine_errors(&filter)?)).await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentQuery {
    window_hours: Option<i64>,
    min_span_minutes: Option<i64>,
}

pub async fn persistent_errors<S: Storage, T: Transport>(
    State(state): State<AppState<S, T>>,
    Query(query): Query<PersistentQuery>,
) -> Result<Json<Vec<PersistentError>>, ApiError> {
    let from = match query.window_hours {
        None => Utc::now() - persistent::DEFAULT_WINDOW,
        Some(h) if h > 0 => TimeDelta::try_hours(h)
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| ApiError::BadRequest(format!("windowHours: out of range, got {h}")))?,
        Some(h) => return Err(ApiError::BadRequest(format!("windowHours: must be positive, got {h}"))),
    };
    let min_span = match query.min_span_minutes {
        None => persistent::DEFAULT_MIN_SPAN,
        Some(m) if m >= 0 => TimeDelta::try_minutes(m)
            .ok_or_else(|| ApiError::BadRequest(format!("minSpanMinutes: out of range, got {m}")))?,
        Some(m) => return Err(ApiError::BadRequest(format!("minSpanMinutes: must not be negative, got {m}"))),
    };
    let filter = MachineErrorFilter {
        from: Some(from),
        to: None,
        machine_id: None,
    };
    let rows = blocking(move || Ok(state.storage.machine_errors(&filter)?)).await?;
    Ok(Json(persistent::persistent_errors(rows.iter().map(|s| &s.record), min_span)))
}
