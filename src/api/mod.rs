//! Local REST surface consumed by the dashboard.
//!
//! Handlers are thin: they parse the query, then run the blocking storage or
//! sync call on tokio's blocking pool.

mod error;
mod routes;

use axum::Router;
use axum::routing::{get, post};
use std::sync::{Arc, Mutex};

use crate::client::{Transport, UreqTransport};
use crate::db::models::{
    AuditCycleUsage, AuditTotalVending, Campus, CoinVault, Location, MachineProgram, MachineType, ProgramModifier,
};
use crate::db::store::Storage;
use crate::services::scheduler::SyncScheduler;
use crate::services::sync::SyncService;

pub use error::ApiError;

pub struct AppState<S: Storage, T: Transport = UreqTransport> {
    pub storage: Arc<S>,
    /// `None` when no partner API key is configured.
    pub sync: Option<Arc<SyncService<S, T>>>,
    pub scheduler: Option<Arc<Mutex<SyncScheduler<SyncService<S, T>>>>>,
}

impl<S: Storage, T: Transport> Clone for AppState<S, T> {
    fn clone(&self) -> Self {
        AppState {
            storage: Arc::clone(&self.storage),
            sync: self.sync.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

pub fn router<S: Storage, T: Transport>(state: AppState<S, T>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/sync/all", post(routes::sync_all::<S, T>))
        .route("/api/sync/locations", post(routes::sync_locations::<S, T>))
        .route("/api/sync/machines", post(routes::sync_machines::<S, T>))
        .route("/api/sync/machine-errors", post(routes::sync_machine_errors::<S, T>))
        .route("/api/sync/logs", get(routes::sync_logs::<S, T>))
        .route("/api/sync/scheduler", get(routes::scheduler_status::<S, T>))
        .route("/api/campuses", get(routes::list_entities::<S, T, Campus>))
        .route("/api/locations", get(routes::list_entities::<S, T, Location>))
        .route("/api/machine-types", get(routes::list_entities::<S, T, MachineType>))
        .route("/api/machines", get(routes::list_machines::<S, T>))
        .route("/api/machine-programs", get(routes::list_entities::<S, T, MachineProgram>))
        .route("/api/program-modifiers", get(routes::list_entities::<S, T, ProgramModifier>))
        .route("/api/machine-errors", get(routes::machine_errors::<S, T>))
        .route("/api/machine-errors/persistent", get(routes::persistent_errors::<S, T>))
        .route("/api/coin-vaults", get(routes::list_entities::<S, T, CoinVault>))
        .route("/api/audit/cycle-usage", get(routes::list_entities::<S, T, AuditCycleUsage>))
        .route("/api/audit/total-vending", get(routes::list_entities::<S, T, AuditTotalVending>))
        .with_state(state)
}
