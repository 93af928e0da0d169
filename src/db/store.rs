//! Storage capabilities used by the sync pipeline and the REST layer.
//!
//! Every fleet entity goes through the same `EntityStore` contract: upsert by
//! natural key, returning the surrogate id. Whether an existing row is
//! overwritten or kept is decided by [`Entity::CONFLICT`], so idempotency is
//! specified once for all tables.

use crate::db::models::{
    AuditCycleUsage, AuditTotalVending, Campus, CoinVault, Entity, Location, Machine, MachineError,
    MachineErrorFilter, MachineProgram, MachineType, NewSyncLog, ProgramModifier, Stored, SyncLog, SyncLogFilter,
};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("connection pool error: {0}")]
    Pool(String),
    #[error("query failed: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub trait EntityStore<E: Entity> {
    /// Create the row if its natural key is new, otherwise apply the
    /// entity's conflict policy. Returns the surrogate id either way.
    fn upsert(&self, record: &E) -> Result<i64, StorageError>;

    /// Surrogate id of the row with this natural key, if synced.
    fn find_id(&self, natural_key: &str) -> Result<Option<i64>, StorageError>;

    fn list(&self) -> Result<Vec<Stored<E>>, StorageError>;
}

pub trait SyncLogStore {
    fn append_sync_log(&self, entry: &NewSyncLog) -> Result<i64, StorageError>;

    /// Newest first.
    fn list_sync_logs(&self, filter: &SyncLogFilter) -> Result<Vec<SyncLog>, StorageError>;
}

pub trait MachineErrorQueries {
    /// Ordered by occurrence time, oldest first.
    fn machine_errors(&self, filter: &MachineErrorFilter) -> Result<Vec<Stored<MachineError>>, StorageError>;
}

/// Everything the sync service and routes need from a backend.
pub trait Storage:
    EntityStore<Campus>
    + EntityStore<Location>
    + EntityStore<MachineType>
    + EntityStore<Machine>
    + EntityStore<MachineProgram>
    + EntityStore<ProgramModifier>
    + EntityStore<MachineError>
    + EntityStore<CoinVault>
    + EntityStore<AuditCycleUsage>
    + EntityStore<AuditTotalVending>
    + SyncLogStore
    + MachineErrorQueries
    + Send
    + Sync
    + 'static
{
}

impl<T> Storage for T where
    T: EntityStore<Campus>
        + EntityStore<Location>
        + EntityStore<MachineType>
        + EntityStore<Machine>
        + EntityStore<MachineProgram>
        + EntityStore<ProgramModifier>
        + EntityStore<MachineError>
        + EntityStore<CoinVault>
        + EntityStore<AuditCycleUsage>
        + EntityStore<AuditTotalVending>
        + SyncLogStore
        + MachineErrorQueries
        + Send
        + Sync
        + 'static
{
}
