//! Postgres storage backend (diesel over an r2d2 pool).

use chrono::{DateTime, Utc};
use diesel::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::upsert::excluded;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use log::info;

use crate::db::models::{
    AuditCycleUsage, AuditTotalVending, Campus, CoinVault, Conflict, Entity, Location, Machine, MachineError,
    MachineErrorFilter, MachineProgram, MachineType, NewSyncLog, ProgramModifier, Stored, SyncLog, SyncLogFilter,
};
use crate::db::store::{EntityStore, MachineErrorQueries, StorageError, SyncLogStore};
use crate::schema;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type PgPool = Pool<ConnectionManager<PgConnection>>;
type PgPooled = PooledConnection<ConnectionManager<PgConnection>>;

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn connect(database_url: &str, max_size: u32) -> Result<Self, StorageError> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(|e| StorageError::Pool(e.to_string()))?;
        Ok(PgStorage { pool })
    }

    fn conn(&self) -> Result<PgPooled, StorageError> {
        self.pool.get().map_err(|e| StorageError::Pool(e.to_string()))
    }

    pub fn apply_migrations(&self) -> Result<(), String> {
        let mut pooled = self.conn().map_err(|e| e.to_string())?;
        apply_database_migrations(&mut pooled)
    }
}

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

fn stored<E>((id, record, created_at, last_sync_at): (i64, E, DateTime<Utc>, DateTime<Utc>)) -> Stored<E> {
    Stored {
        id,
        record,
        created_at,
        last_sync_at,
    }
}

fn parse_pair_key(key: &str) -> Option<(i64, i64)> {
    let (a, b) = key.split_once(':')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

macro_rules! pg_list {
    ($entity:ty, $table:ident) => {
        fn list(&self) -> Result<Vec<Stored<$entity>>, StorageError> {
            use schema::$table::dsl as T;
            let mut conn = self.conn()?;
            let rows = T::$table
                .select((T::id, <$entity>::as_select(), T::created_at, T::last_sync_at))
                .order(T::id.asc())
                .load::<(i64, $entity, DateTime<Utc>, DateTime<Utc>)>(&mut conn)?;
            Ok(rows.into_iter().map(stored).collect())
        }
    };
}

/// `INSERT .. ON CONFLICT .. DO UPDATE` for entities whose `Entity::CONFLICT`
/// is `Conflict::Update`; a mismatch fails to compile.
macro_rules! pg_entity_store {
    ($entity:ty, $table:ident, key: $key:ident, update: [$($field:ident),+ $(,)?]) => {
        impl EntityStore<$entity> for PgStorage {
            fn upsert(&self, record: &$entity) -> Result<i64, StorageError> {
                use schema::$table::dsl as T;
                let mut conn = self.conn()?;
                let id = diesel::insert_into(T::$table)
                    .values(record)
                    .on_conflict(T::$key)
                    .do_update()
                    .set(($(T::$field.eq(excluded(T::$field)),)+ T::last_sync_at.eq(Utc::now())))
                    .returning(T::id)
                    .get_result::<i64>(&mut conn)?;
                Ok(id)
            }

            fn find_id(&self, natural_key: &str) -> Result<Option<i64>, StorageError> {
                use schema::$table::dsl as T;
                let mut conn = self.conn()?;
                let id = T::$table
                    .filter(T::$key.eq(natural_key))
                    .select(T::id)
                    .first::<i64>(&mut conn)
                    .optional()?;
                Ok(id)
            }

            pg_list!($entity, $table);
        }

        const _: () = assert!(
            matches!(<$entity as Entity>::CONFLICT, Conflict::Update),
            concat!(stringify!($entity), " is upserted with DO UPDATE")
        );
    };
    ($entity:ty, $table:ident, pair: ($k1:ident, $k2:ident), update: [$($field:ident),+ $(,)?]) => {
        impl EntityStore<$entity> for PgStorage {
            fn upsert(&self, record: &$entity) -> Result<i64, StorageError> {
                use schema::$table::dsl as T;
                let mut conn = self.conn()?;
                let id = diesel::insert_into(T::$table)
                    .values(record)
                    .on_conflict((T::$k1, T::$k2))
                    .do_update()
                    .set(($(T::$field.eq(excluded(T::$field)),)+ T::last_sync_at.eq(Utc::now())))
                    .returning(T::id)
                    .get_result::<i64>(&mut conn)?;
                Ok(id)
            }

            fn find_id(&self, natural_key: &str) -> Result<Option<i64>, StorageError> {
                use schema::$table::dsl as T;
                let Some((a, b)) = parse_pair_key(natural_key) else {
                    return Ok(None);
                };
                let mut conn = self.conn()?;
                let id = T::$table
                    .filter(T::$k1.eq(a).and(T::$k2.eq(b)))
                    .select(T::id)
                    .first::<i64>(&mut conn)
                    .optional()?;
                Ok(id)
            }

            pg_list!($entity, $table);
        }

        const _: () = assert!(
            matches!(<$entity as Entity>::CONFLICT, Conflict::Update),
            concat!(stringify!($entity), " is upserted with DO UPDATE")
        );
    };
}

pg_entity_store!(Campus, campuses, key: slug, update: [name]);
pg_entity_store!(
    Location,
    locations,
    key: external_id,
    update: [name, timezone, address, latitude, longitude, status, campus_id]
);
pg_entity_store!(
    MachineType,
    machine_types,
    key: name,
    update: [is_washer, is_dryer, is_combo, description]
);
pg_entity_store!(
    Machine,
    machines,
    key: external_id,
    update: [name, location_id, machine_type_id, control_id, serial_number, model_number, status]
);
pg_entity_store!(
    MachineProgram,
    machine_programs,
    key: external_id,
    update: [name, program_type, sort_order, machine_type_id, machine_id]
);
pg_entity_store!(
    ProgramModifier,
    program_modifiers,
    key: external_id,
    update: [name, modifier_type, sort_order, program_id, machine_type_id, machine_id]
);
pg_entity_store!(
    CoinVault,
    coin_vaults,
    pair: (location_id, machine_id),
    update: [vault_size, total_coins, percent_full, first_received_at, last_received_at]
);
pg_entity_store!(
    AuditCycleUsage,
    audit_cycle_usage,
    pair: (location_id, machine_id),
    update: [total_cycles, hot_cycles, warm_cycles, cold_cycles, cycles_by_type, first_received_at, last_received_at]
);
pg_entity_store!(
    AuditTotalVending,
    audit_total_vending,
    pair: (location_id, machine_id),
    update: [total_vended_cents, coin_vended_cents, card_vended_cents, first_received_at, last_received_at]
);

// Errors are insert-once, so they skip the DO UPDATE path.
const _: () = assert!(matches!(MachineError::CONFLICT, Conflict::Ignore));

impl EntityStore<MachineError> for PgStorage {
    fn upsert(&self, record: &MachineError) -> Result<i64, StorageError> {
        use schema::machine_errors::dsl as E;
        let mut conn = self.conn()?;
        diesel::insert_into(E::machine_errors)
            .values(record)
            .on_conflict(E::external_id)
            .do_nothing()
            .execute(&mut conn)?;
        let id = E::machine_errors
            .filter(E::external_id.eq(&record.external_id))
            .select(E::id)
            .first::<i64>(&mut conn)?;
        Ok(id)
    }

    fn find_id(&self, natural_key: &str) -> Result<Option<i64>, StorageError> {
        use schema::machine_errors::dsl as E;
        let mut conn = self.conn()?;
        let id = E::machine_errors
            .filter(E::external_id.eq(natural_key))
            .select(E::id)
            .first::<i64>(&mut conn)
            .optional()?;
        Ok(id)
    }

    pg_list!(MachineError, machine_errors);
}

impl MachineErrorQueries for PgStorage {
    fn machine_errors(&self, filter: &MachineErrorFilter) -> Result<Vec<Stored<MachineError>>, StorageError> {
        use schema::machine_errors::dsl as E;
        let mut conn = self.conn()?;
        let mut query = E::machine_errors
            .select((E::id, MachineError::as_select(), E::created_at, E::last_sync_at))
            .into_boxed();
        if let Some(from) = filter.from {
            query = query.filter(E::occurred_at.ge(from));
        }
        if let Some(to) = filter.to {
            query = query.filter(E::occurred_at.le(to));
        }
        if let Some(machine_id) = filter.machine_id {
            query = query.filter(E::machine_id.eq(machine_id));
        }
        let rows = query
            .order((E::occurred_at.asc(), E::id.asc()))
            .load::<(i64, MachineError, DateTime<Utc>, DateTime<Utc>)>(&mut conn)?;
        Ok(rows.into_iter().map(stored).collect())
    }
}

impl SyncLogStore for PgStorage {
    fn append_sync_log(&self, entry: &NewSyncLog) -> Result<i64, StorageError> {
        use schema::sync_logs::dsl as L;
        let mut conn = self.conn()?;
        let id = diesel::insert_into(L::sync_logs)
            .values(entry)
            .returning(L::id)
            .get_result::<i64>(&mut conn)?;
        Ok(id)
    }

    fn list_sync_logs(&self, filter: &SyncLogFilter) -> Result<Vec<SyncLog>, StorageError> {
        use schema::sync_logs::dsl as L;
        let mut conn = self.conn()?;
        let mut query = L::sync_logs.select(SyncLog::as_select()).into_boxed();
        if let Some(from) = filter.from {
            query = query.filter(L::created_at.ge(from));
        }
        if let Some(to) = filter.to {
            query = query.filter(L::created_at.le(to));
        }
        if let Some(sync_type) = filter.sync_type {
            query = query.filter(L::sync_type.eq(sync_type.as_str()));
        }
        if let Some(success) = filter.success {
            query = query.filter(L::success.eq(success));
        }
        if let Some(limit) = filter.limit {
            query = query.limit(limit);
        }
        let rows = query.order((L::created_at.desc(), L::id.desc())).load(&mut conn)?;
        Ok(rows)
    }
}
