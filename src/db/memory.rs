//! In-process storage backend with the same upsert semantics as Postgres.

use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::db::models::{
    Conflict, Entity, MachineError, MachineErrorFilter, NewSyncLog, Stored, SyncLog, SyncLogFilter,
};
use crate::db::store::{EntityStore, MachineErrorQueries, StorageError, SyncLogStore};

struct Row {
    id: i64,
    key: String,
    created_at: DateTime<Utc>,
    last_sync_at: DateTime<Utc>,
    record: Box<dyn Any + Send>,
}

#[derive(Default)]
struct Table {
    next_id: i64,
    rows: Vec<Row>,
}

#[derive(Default)]
struct Tables {
    entities: BTreeMap<&'static str, Table>,
    sync_logs: Vec<SyncLog>,
}

#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }

    /// Rows currently held for `E`.
    pub fn count<E: Entity>(&self) -> usize {
        self.lock()
            .map(|t| t.entities.get(E::TABLE).map_or(0, |table| table.rows.len()))
            .unwrap_or(0)
    }

    pub fn sync_logs(&self) -> Vec<SyncLog> {
        self.lock().map(|t| t.sync_logs.clone()).unwrap_or_default()
    }
}

fn downcast<E: Entity>(row: &Row) -> Result<Stored<E>, StorageError> {
    let record = row
        .record
        .downcast_ref::<E>()
        .ok_or_else(|| StorageError::Backend(format!("row type mismatch in {}", E::TABLE)))?;
    Ok(Stored {
        id: row.id,
        record: record.clone(),
        created_at: row.created_at,
        last_sync_at: row.last_sync_at,
    })
}

impl<E: Entity> EntityStore<E> for MemoryStorage {
    fn upsert(&self, record: &E) -> Result<i64, StorageError> {
        let mut tables = self.lock()?;
        let table = tables.entities.entry(E::TABLE).or_default();
        let key = record.natural_key();
        let now = Utc::now();

        if let Some(row) = table.rows.iter_mut().find(|r| r.key == key) {
            if E::CONFLICT == Conflict::Update {
                row.record = Box::new(record.clone());
                row.last_sync_at = now;
            }
            return Ok(row.id);
        }

        table.next_id += 1;
        let id = table.next_id;
        table.rows.push(Row {
            id,
            key,
            created_at: now,
            last_sync_at: now,
            record: Box::new(record.clone()),
        });
        Ok(id)
    }

    fn find_id(&self, natural_key: &str) -> Result<Option<i64>, StorageError> {
        let tables = self.lock()?;
        Ok(tables
            .entities
            .get(E::TABLE)
            .and_then(|t| t.rows.iter().find(|r| r.key == natural_key))
            .map(|r| r.id))
    }

    fn list(&self) -> Result<Vec<Stored<E>>, StorageError> {
        let tables = self.lock()?;
        match tables.entities.get(E::TABLE) {
            Some(table) => table.rows.iter().map(downcast::<E>).collect(),
            None => Ok(Vec::new()),
        }
    }
}

impl MachineErrorQueries for MemoryStorage {
    fn machine_errors(&self, filter: &MachineErrorFilter) -> Result<Vec<Stored<MachineError>>, StorageError> {
        let mut rows: Vec<Stored<MachineError>> = EntityStore::<MachineError>::list(self)?
            .into_iter()
            .filter(|s| filter.matches(&s.record))
            .collect();
        rows.sort_by_key(|s| (s.record.occurred_at, s.id));
        Ok(rows)
    }
}

impl SyncLogStore for MemoryStorage {
    fn append_sync_log(&self, entry: &NewSyncLog) -> Result<i64, StorageError> {
        let mut tables = self.lock()?;
        let id = i64::try_from(tables.sync_logs.len()).unwrap_or(i64::MAX - 1) + 1;
        tables.sync_logs.push(SyncLog {
            id,
            endpoint: entry.endpoint.clone(),
            method: entry.method.clone(),
            success: entry.success,
            error_message: entry.error_message.clone(),
            duration_ms: entry.duration_ms,
            status_code: entry.status_code,
            response_excerpt: entry.response_excerpt.clone(),
            location_count: entry.location_count,
            machine_count: entry.machine_count,
            program_count: entry.program_count,
            user_id: entry.user_id.clone(),
            sync_type: entry.sync_type.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    fn list_sync_logs(&self, filter: &SyncLogFilter) -> Result<Vec<SyncLog>, StorageError> {
        let tables = self.lock()?;
        let mut rows: Vec<SyncLog> = tables.sync_logs.iter().filter(|l| filter.matches(l)).cloned().collect();
        // ids follow insertion order
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        if let Some(limit) = filter.limit.and_then(|l| usize::try_from(l).ok()) {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}
