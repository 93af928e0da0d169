//! Resource synchronizers and the orchestrated entry points built on them.
//!
//! Traversal is strictly sequential: locations, then per location its
//! machines (with each machine's errors, and programs when enabled), then
//! the three per-location reports. A failure inside one location or machine
//! block becomes a [`SkipReason`] in the run's [`SyncReport`]; only the
//! top-level `/locations` fetch aborts a run.

use chrono::{TimeDelta, Utc};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Instant;

use crate::client::{ClientError, InsightsClient, Transport, UreqTransport};
use crate::db::models::{
    AuditCycleUsage, AuditTotalVending, Campus, CoinVault, Entity, Location, Machine, MachineError, MachineProgram,
    MachineType, NewSyncLog, ProgramModifier, RunContext,
};
use crate::db::store::{EntityStore, Storage, StorageError};
use crate::models::insights::{
    CoinVaultEntry, CycleUsageEntry, InsightsCycle, InsightsLocation, InsightsMachine, InsightsMachineError,
    ReportLocation, TotalVendingEntry, report_ids,
};
use crate::services::pipeline::{Resource, SkipReason, SyncReport, decode, envelope_items};
use crate::utils::{derive_campus, format_query_time};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("a sync run is already in progress")]
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Fetch machine programs during the full traversal.
    pub include_programs: bool,
    pub error_lookback: TimeDelta,
    pub report_lookback: TimeDelta,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            include_programs: false,
            error_lookback: TimeDelta::hours(24),
            report_lookback: TimeDelta::hours(24),
        }
    }
}

pub struct SyncService<S: Storage, T: Transport = UreqTransport> {
    storage: Arc<S>,
    client: InsightsClient<T>,
    options: SyncOptions,
    run_lock: Mutex<()>,
}

impl<S: Storage, T: Transport> SyncService<S, T> {
    pub fn new(storage: Arc<S>, client: InsightsClient<T>, options: SyncOptions) -> Self {
        SyncService {
            storage,
            client,
            options,
            run_lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Full traversal with a `sync:all` summary row.
    pub fn sync_all(&self, run: &RunContext) -> Result<SyncReport, SyncError> {
        self.run_logged(run, "sync:all", |report| self.sync_locations(run, report))
    }

    pub fn trigger_locations(&self, run: &RunContext) -> Result<SyncReport, SyncError> {
        self.run_logged(run, "sync:locations", |report| self.sync_locations(run, report))
    }

    /// Machines and their programs for every stored location.
    pub fn trigger_machines(&self, run: &RunContext) -> Result<SyncReport, SyncError> {
        self.run_logged(run, "sync:machines", |report| {
            for location in EntityStore::<Location>::list(&*self.storage)? {
                let scope = MachineScope {
                    errors: false,
                    programs: true,
                };
                self.sync_machines_for_location(run, &location.record.external_id, location.id, scope, report);
            }
            Ok(())
        })
    }

    /// Errors for every stored machine.
    pub fn trigger_machine_errors(&self, run: &RunContext) -> Result<SyncReport, SyncError> {
        self.run_logged(run, "sync:machine-errors", |report| {
            let locations: BTreeMap<i64, String> = EntityStore::<Location>::list(&*self.storage)?
                .into_iter()
                .map(|l| (l.id, l.record.external_id))
                .collect();
            for machine in EntityStore::<Machine>::list(&*self.storage)? {
                let m = &machine.record;
                let Some(loc_ext) = locations.get(&m.location_id) else {
                    report.skip(SkipReason::missing_parent(
                        Resource::MachineError,
                        &m.external_id,
                        Resource::Location,
                        &m.location_id.to_string(),
                    ));
                    continue;
                };
                self.sync_machine_errors(run, loc_ext, &m.external_id, machine.id, m.location_id, report);
            }
            Ok(())
        })
    }

    /// Serialises runs, times the body and writes the summary row.
    fn run_logged(
        &self,
        run: &RunContext,
        label: &str,
        body: impl FnOnce(&mut SyncReport) -> Result<(), SyncError>,
    ) -> Result<SyncReport, SyncError> {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                warn!("Sync: {} rejected, another run is in progress", label);
                return Err(SyncError::AlreadyRunning);
            }
            // a panicked run leaves nothing to protect
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        info!("Sync: {} started ({})", label, run.sync_type);
        let started = Instant::now();
        let mut report = SyncReport::default();
        let outcome = body(&mut report);
        let elapsed = started.elapsed();
        report.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        let summary = NewSyncLog::run_summary(run, label, elapsed, outcome.as_ref().err().map(|e| e.to_string()))
            .with_counts(
                report.count(Resource::Location),
                report.count(Resource::Machine),
                report.count(Resource::MachineProgram),
            );
        if let Err(e) = self.storage.append_sync_log(&summary) {
            warn!("Failed to record summary log for {}: {}", label, e);
        }

        match outcome {
            Ok(()) => {
                info!(
                    "Sync: {} finished in {}ms: {} locations, {} machines, {} errors, {} skipped",
                    label,
                    report.duration_ms,
                    report.count(Resource::Location),
                    report.count(Resource::Machine),
                    report.count(Resource::MachineError),
                    report.skipped.len()
                );
                Ok(report)
            }
            Err(e) => {
                error!("Sync: {} failed after {}ms: {}", label, report.duration_ms, e);
                Err(e)
            }
        }
    }

    fn upsert<E: Entity>(&self, record: &E) -> Result<i64, StorageError>
    where
        S: EntityStore<E>,
    {
        EntityStore::<E>::upsert(&*self.storage, record)
    }

    fn sync_locations(&self, run: &RunContext, report: &mut SyncReport) -> Result<(), SyncError> {
        let payload = self.client.fetch_json(&*self.storage, run, "/locations", &[])?;
        let items = match envelope_items(&payload, Resource::Location, &["data"]) {
            Ok(items) => items,
            Err(skip) => {
                report.skip(skip);
                return Ok(());
            }
        };
        info!("Sync: {} locations upstream", items.len());

        for item in items {
            let location: InsightsLocation = match decode(item, Resource::Location) {
                Ok(l) => l,
                Err(skip) => {
                    report.skip(skip);
                    continue;
                }
            };
            let location_id = match self.sync_location(&location, report) {
                Ok(id) => id,
                Err(skip) => {
                    report.skip(skip);
                    continue;
                }
            };
            info!("Sync: location {} ({})", location.id, location.name);

            let scope = MachineScope {
                errors: true,
                programs: self.options.include_programs,
            };
            self.sync_machines_for_location(run, &location.id, location_id, scope, report);
            self.sync_report::<CoinVaultReport>(run, &location.id, location_id, report);
            self.sync_report::<TotalVendingReport>(run, &location.id, location_id, report);
            self.sync_report::<CycleUsageReport>(run, &location.id, location_id, report);
        }
        Ok(())
    }

    /// Campus then location; returns the location's surrogate id.
    fn sync_location(&self, location: &InsightsLocation, report: &mut SyncReport) -> Result<i64, SkipReason> {
        let campus = derive_campus(&location.name);
        let campus_id = self
            .upsert(&Campus {
                slug: campus.slug.clone(),
                name: campus.name,
            })
            .map_err(|e| SkipReason::failed(Resource::Campus, &campus.slug, e))?;
        report.tally(Resource::Campus);

        let row = Location {
            external_id: location.id.clone(),
            name: location.name.clone(),
            timezone: location.timezone.clone(),
            address: location.address.clone(),
            latitude: location.latitude,
            longitude: location.longitude,
            status: location.status.clone(),
            campus_id: Some(campus_id),
        };
        let id = self
            .upsert(&row)
            .map_err(|e| SkipReason::failed(Resource::Location, &location.id, e))?;
        report.tally(Resource::Location);
        Ok(id)
    }

    fn sync_machines_for_location(
        &self,
        run: &RunContext,
        loc_ext: &str,
        location_id: i64,
        scope: MachineScope,
        report: &mut SyncReport,
    ) {
        let endpoint = format!("/locations/{loc_ext}/machines");
        let payload = match self.client.fetch_json(&*self.storage, run, &endpoint, &[]) {
            Ok(p) => p,
            Err(e) => {
                report.skip(SkipReason::failed(Resource::Machine, &endpoint, e));
                return;
            }
        };
        let items = match envelope_items(&payload, Resource::Machine, &["data"]) {
            Ok(items) => items,
            Err(skip) => {
                report.skip(skip);
                return;
            }
        };

        for item in items {
            let machine: InsightsMachine = match decode(item, Resource::Machine) {
                Ok(m) => m,
                Err(skip) => {
                    report.skip(skip);
                    continue;
                }
            };
            let (machine_id, type_id) = match self.sync_machine(&machine, location_id, report) {
                Ok(ids) => ids,
                Err(skip) => {
                    report.skip(skip);
                    continue;
                }
            };
            debug!("Sync: machine {} at {}", machine.id, loc_ext);

            if scope.errors {
                self.sync_machine_errors(run, loc_ext, &machine.id, machine_id, location_id, report);
            }
            if scope.programs {
                self.sync_machine_programs(run, loc_ext, &machine.id, machine_id, type_id, report);
            }
        }
    }

    /// Machine type (when reported) then machine.
    fn sync_machine(
        &self,
        machine: &InsightsMachine,
        location_id: i64,
        report: &mut SyncReport,
    ) -> Result<(i64, Option<i64>), SkipReason> {
        let type_id = match &machine.machine_type {
            Some(t) => {
                let id = self
                    .upsert(&MachineType {
                        name: t.name.clone(),
                        is_washer: t.is_washer,
                        is_dryer: t.is_dryer,
                        is_combo: t.is_combo,
                        description: t.description.clone(),
                    })
                    .map_err(|e| SkipReason::failed(Resource::MachineType, &t.name, e))?;
                report.tally(Resource::MachineType);
                Some(id)
            }
            None => None,
        };

        let row = Machine {
            external_id: machine.id.clone(),
            name: machine.name.clone(),
            location_id,
            machine_type_id: type_id,
            control_id: machine.control_id.clone(),
            serial_number: machine.serial_number.clone(),
            model_number: machine.model_number.clone(),
            status: machine.status.clone(),
        };
        let id = self
            .upsert(&row)
            .map_err(|e| SkipReason::failed(Resource::Machine, &machine.id, e))?;
        report.tally(Resource::Machine);
        Ok((id, type_id))
    }

    fn sync_machine_errors(
        &self,
        run: &RunContext,
        loc_ext: &str,
        mac_ext: &str,
        machine_id: i64,
        location_id: i64,
        report: &mut SyncReport,
    ) {
        let end = Utc::now();
        let Some(start) = end.checked_sub_signed(self.options.error_lookback) else {
            report.skip(SkipReason::failed(Resource::MachineError, mac_ext, LookbackOutOfRange));
            return;
        };
        let endpoint = format!("/locations/{loc_ext}/machines/{mac_ext}/errors");
        let query = [("start", format_query_time(start)), ("end", format_query_time(end))];
        let payload = match self.client.fetch_json(&*self.storage, run, &endpoint, &query) {
            Ok(p) => p,
            Err(e) => {
                report.skip(SkipReason::failed(Resource::MachineError, mac_ext, e));
                return;
            }
        };
        let items = match envelope_items(&payload, Resource::MachineError, &["data"]) {
            Ok(items) => items,
            Err(skip) => {
                report.skip(skip);
                return;
            }
        };

        for item in items {
            let err: InsightsMachineError = match decode(item, Resource::MachineError) {
                Ok(e) => e,
                Err(skip) => {
                    report.skip(skip);
                    continue;
                }
            };
            let row = MachineError {
                external_id: err.id.clone(),
                machine_id,
                location_id,
                error_name: err.error_name,
                error_type: err.error_type,
                error_code: err.error_code,
                occurred_at: err.timestamp,
            };
            match self.upsert(&row) {
                Ok(_) => report.tally(Resource::MachineError),
                Err(e) => report.skip(SkipReason::failed(Resource::MachineError, &err.id, e)),
            }
        }
    }

    fn sync_machine_programs(
        &self,
        run: &RunContext,
        loc_ext: &str,
        mac_ext: &str,
        machine_id: i64,
        machine_type_id: Option<i64>,
        report: &mut SyncReport,
    ) {
        let endpoint = format!("/locations/{loc_ext}/machines/{mac_ext}/cycles");
        let payload = match self.client.fetch_json(&*self.storage, run, &endpoint, &[]) {
            Ok(p) => p,
            Err(e) => {
                report.skip(SkipReason::failed(Resource::MachineProgram, mac_ext, e));
                return;
            }
        };
        let items = match envelope_items(&payload, Resource::MachineProgram, &["data"]) {
            Ok(items) => items,
            Err(skip) => {
                report.skip(skip);
                return;
            }
        };

        for item in items {
            let cycle: InsightsCycle = match decode(item, Resource::MachineProgram) {
                Ok(c) => c,
                Err(skip) => {
                    report.skip(skip);
                    continue;
                }
            };
            let program = MachineProgram {
                external_id: cycle.id.clone(),
                name: cycle.name.clone(),
                program_type: cycle.cycle_type.clone(),
                sort_order: cycle.sort_order,
                machine_type_id,
                machine_id: Some(machine_id),
            };
            let program_id = match self.upsert(&program) {
                Ok(id) => id,
                Err(e) => {
                    report.skip(SkipReason::failed(Resource::MachineProgram, &cycle.id, e));
                    continue;
                }
            };
            report.tally(Resource::MachineProgram);

            for modifier in &cycle.modifiers {
                let row = ProgramModifier {
                    external_id: modifier.id.clone(),
                    name: modifier.name.clone(),
                    modifier_type: modifier.modifier_type.clone(),
                    sort_order: modifier.sort_order,
                    program_id: Some(program_id),
                    machine_type_id,
                    machine_id: Some(machine_id),
                };
                match self.upsert(&row) {
                    Ok(_) => report.tally(Resource::ProgramModifier),
                    Err(e) => report.skip(SkipReason::failed(Resource::ProgramModifier, &modifier.id, e)),
                }
            }
        }
    }

    /// One `/reports` call for a single location; entries for machines not
    /// yet synced are skipped.
    fn sync_report<K: ReportKind>(&self, run: &RunContext, loc_ext: &str, location_id: i64, report: &mut SyncReport)
    where
        S: EntityStore<K::Row>,
    {
        let end = Utc::now();
        let Some(start) = end.checked_sub_signed(self.options.report_lookback) else {
            report.skip(SkipReason::failed(K::RESOURCE, loc_ext, LookbackOutOfRange));
            return;
        };
        let query = [
            ("reportId", K::REPORT_ID.to_string()),
            ("locationIds", loc_ext.to_string()),
            ("startDate", format_query_time(start)),
            ("endDate", format_query_time(end)),
        ];
        let payload = match self.client.fetch_json(&*self.storage, run, "/reports", &query) {
            Ok(p) => p,
            Err(e) => {
                report.skip(SkipReason::failed(K::RESOURCE, loc_ext, e));
                return;
            }
        };
        let blocks = match envelope_items(&payload, K::RESOURCE, &["data", "locations"]) {
            Ok(blocks) => blocks,
            Err(skip) => {
                report.skip(skip);
                return;
            }
        };

        for block in blocks {
            let block: ReportLocation = match decode(block, K::RESOURCE) {
                Ok(b) => b,
                Err(skip) => {
                    report.skip(skip);
                    continue;
                }
            };
            if block.id != loc_ext {
                continue;
            }
            for entry in &block.machines {
                match self.report_row::<K>(entry, loc_ext, location_id) {
                    Ok(()) => report.tally(K::RESOURCE),
                    Err(skip) => report.skip(skip),
                }
            }
        }
    }

    fn report_row<K: ReportKind>(&self, entry: &serde_json::Value, loc_ext: &str, location_id: i64) -> Result<(), SkipReason>
    where
        S: EntityStore<K::Row>,
    {
        let entry: K::Entry = decode(entry, K::RESOURCE)?;
        let mac_ext = K::machine_key(&entry).to_string();
        let machine_id = EntityStore::<Machine>::find_id(&*self.storage, &mac_ext)
            .map_err(|e| SkipReason::failed(K::RESOURCE, &mac_ext, e))?
            .ok_or_else(|| SkipReason::missing_parent(K::RESOURCE, loc_ext, Resource::Machine, &mac_ext))?;
        self.upsert(&K::into_row(entry, location_id, machine_id))
            .map_err(|e| SkipReason::failed(K::RESOURCE, &mac_ext, e))?;
        Ok(())
    }
}

#[derive(Debug, Copy, Clone)]
struct MachineScope {
    errors: bool,
    programs: bool,
}

/// A `/reports` flavour: how its entries decode and which table they land in.
#[derive(Debug, thiserror::Error)]
#[error("lookback window reaches past the representable date range")]
struct LookbackOutOfRange;

trait ReportKind {
    const REPORT_ID: &'static str;
    const RESOURCE: Resource;
    type Entry: DeserializeOwned;
    type Row: Entity;

    fn machine_key(entry: &Self::Entry) -> &str;
    fn into_row(entry: Self::Entry, location_id: i64, machine_id: i64) -> Self::Row;
}

struct CoinVaultReport;
struct CycleUsageReport;
struct TotalVendingReport;

impl ReportKind for CoinVaultReport {
    const REPORT_ID: &'static str = report_ids::COIN_VAULT;
    const RESOURCE: Resource = Resource::CoinVault;
    type Entry = CoinVaultEntry;
    type Row = CoinVault;

    fn machine_key(entry: &CoinVaultEntry) -> &str {
        &entry.id
    }

    fn into_row(entry: CoinVaultEntry, location_id: i64, machine_id: i64) -> CoinVault {
        let percent_full = entry.percent_full.or(match (entry.total_coins, entry.vault_size) {
            (Some(coins), Some(size)) if size > 0 => Some(f64::from(coins) * 100.0 / f64::from(size)),
            _ => None,
        });
        CoinVault {
            location_id,
            machine_id,
            vault_size: entry.vault_size,
            total_coins: entry.total_coins,
            percent_full,
            first_received_at: entry.first_received_at,
            last_received_at: entry.last_received_at,
        }
    }
}

impl ReportKind for CycleUsageReport {
    const REPORT_ID: &'static str = report_ids::AUDIT_CYCLE_USAGE;
    const RESOURCE: Resource = Resource::AuditCycleUsage;
    type Entry = CycleUsageEntry;
    type Row = AuditCycleUsage;

    fn machine_key(entry: &CycleUsageEntry) -> &str {
        &entry.id
    }

    fn into_row(entry: CycleUsageEntry, location_id: i64, machine_id: i64) -> AuditCycleUsage {
        let cycles_by_type = if entry.cycles_by_type.is_empty() {
            None
        } else {
            serde_json::to_value(&entry.cycles_by_type).ok()
        };
        AuditCycleUsage {
            location_id,
            machine_id,
            total_cycles: entry.total_cycles,
            hot_cycles: entry.hot_cycles,
            warm_cycles: entry.warm_cycles,
            cold_cycles: entry.cold_cycles,
            cycles_by_type,
            first_received_at: entry.first_received_at,
            last_received_at: entry.last_received_at,
        }
    }
}

impl ReportKind for TotalVendingReport {
    const REPORT_ID: &'static str = report_ids::AUDIT_TOTAL_VENDING;
    const RESOURCE: Resource = Resource::AuditTotalVending;
    type Entry = TotalVendingEntry;
    type Row = AuditTotalVending;

    fn machine_key(entry: &TotalVendingEntry) -> &str {
        &entry.id
    }

    fn into_row(entry: TotalVendingEntry, location_id: i64, machine_id: i64) -> AuditTotalVending {
        AuditTotalVending {
            location_id,
            machine_id,
            total_vended_cents: entry.total_vended,
            coin_vended_cents: entry.coin_vended,
            card_vended_cents: entry.card_vended,
            first_received_at: entry.first_received_at,
            last_received_at: entry.last_received_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DEFAULT_TIMEOUT;
    use crate::db::memory::MemoryStorage;
    use crate::db::models::{Stored, SyncType};
    use crate::db::store::SyncLogStore;
    use crate::test_support::{BASE_URL, FakePartner, Reply};
    use crate::utils::UNKNOWN_CAMPUS_SLUG;
    use chrono::DateTime;
    use serde_json::json;

    fn service(partner: FakePartner) -> SyncService<MemoryStorage, FakePartner> {
        service_with(partner, SyncOptions::default())
    }

    fn service_with(partner: FakePartner, options: SyncOptions) -> SyncService<MemoryStorage, FakePartner> {
        let client = InsightsClient::with_transport(partner, BASE_URL, "test-key", DEFAULT_TIMEOUT);
        SyncService::new(Arc::new(MemoryStorage::new()), client, options)
    }

    fn location_id(store: &MemoryStorage, external_id: &str) -> i64 {
        EntityStore::<Location>::find_id(store, external_id).unwrap().unwrap()
    }

    fn machines_at(store: &MemoryStorage, location_id: i64) -> usize {
        let machines: Vec<Stored<Machine>> = store.list().unwrap();
        machines.iter().filter(|m| m.record.location_id == location_id).count()
    }

    #[test]
    fn full_sync_stores_the_whole_fleet() {
        let partner = FakePartner::with_fleet(2, 3, 1).with_reports(2, 3);
        let service = service(partner);

        let report = service.sync_all(&RunContext::manual(None)).unwrap();
        let store = service.storage();

        assert_eq!(store.count::<Location>(), 2);
        assert_eq!(store.count::<Machine>(), 6);
        assert_eq!(store.count::<MachineError>(), 6);
        assert_eq!(store.count::<Campus>(), 2);
        assert_eq!(store.count::<MachineType>(), 1);
        assert_eq!(store.count::<CoinVault>(), 6);
        assert_eq!(store.count::<AuditCycleUsage>(), 6);
        assert_eq!(store.count::<AuditTotalVending>(), 6);
        assert!(store.sync_logs().iter().filter(|l| l.success).count() >= 2);

        assert_eq!(report.count(Resource::Machine), 6);
        assert!(report.skipped.is_empty(), "{:?}", report.skipped);
    }

    #[test]
    fn summary_row_carries_aggregated_counts() {
        let service = service(FakePartner::with_fleet(2, 3, 1).with_reports(2, 3));
        service.sync_all(&RunContext::manual(Some("ops-1".into()))).unwrap();

        let logs = service.storage().sync_logs();
        let summary = logs.iter().find(|l| l.endpoint == "sync:all").unwrap();
        assert_eq!(summary.method, "SYNC");
        assert!(summary.success);
        assert_eq!(summary.location_count, 2);
        assert_eq!(summary.machine_count, 6);
        assert_eq!(summary.program_count, 0);
        assert_eq!(summary.user_id.as_deref(), Some("ops-1"));
        assert_eq!(summary.sync_type, "manual");
    }

    #[test]
    fn rerun_with_same_data_creates_no_duplicates() {
        let service = service(FakePartner::with_fleet(2, 3, 1).with_reports(2, 3));
        let run = RunContext::new(SyncType::Scheduled);

        service.trigger_locations(&run).unwrap();
        let first_ids: Vec<i64> = EntityStore::<Machine>::list(&**service.storage())
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        service.trigger_locations(&run).unwrap();
        let store = service.storage();

        assert_eq!(store.count::<Location>(), 2);
        assert_eq!(store.count::<Machine>(), 6);
        assert_eq!(store.count::<MachineError>(), 6);
        assert_eq!(store.count::<CoinVault>(), 6);
        let second_ids: Vec<i64> = EntityStore::<Machine>::list(&**store).unwrap().iter().map(|m| m.id).collect();
        assert_eq!(first_ids, second_ids);
    }

    #[test]
    fn machines_failure_at_one_location_does_not_stop_the_next() {
        let partner = FakePartner::with_fleet(2, 3, 1);
        partner.reply("/locations/loc_0/machines", Reply::status(500, "internal error"));
        let service = service(partner);

        let report = service.trigger_locations(&RunContext::manual(None)).unwrap();
        let store = service.storage();

        assert_eq!(store.count::<Location>(), 2);
        assert_eq!(machines_at(store, location_id(store, "loc_0")), 0);
        assert_eq!(machines_at(store, location_id(store, "loc_1")), 3);
        assert!(
            store
                .sync_logs()
                .iter()
                .any(|l| !l.success && l.error_message.as_deref().is_some_and(|m| m.contains("500")))
        );
        assert!(report.skipped.iter().any(|s| matches!(
            s,
            SkipReason::Failed { resource: Resource::Machine, detail, .. } if detail.contains("500")
        )));
    }

    #[test]
    fn locations_fetch_failure_aborts_and_logs_failed_summary() {
        let partner = FakePartner::new();
        partner.reply("/locations", Reply::status(502, "bad gateway"));
        let service = service(partner);

        let err = service.sync_all(&RunContext::manual(None)).unwrap_err();
        assert!(matches!(err, SyncError::Client(ClientError::Http { status: 502, .. })));

        let logs = service.storage().sync_logs();
        let summary = logs.iter().find(|l| l.endpoint == "sync:all").unwrap();
        assert!(!summary.success);
        assert!(summary.error_message.as_deref().unwrap().contains("502"));
    }

    #[test]
    fn missing_envelope_is_a_skip_not_an_error() {
        let partner = FakePartner::new();
        partner.reply("/locations", Reply::json(json!({ "items": [] })));
        let service = service(partner);

        let report = service.sync_all(&RunContext::manual(None)).unwrap();
        assert_eq!(report.count(Resource::Location), 0);
        assert!(matches!(
            report.skipped.as_slice(),
            [SkipReason::MissingEnvelope {
                resource: Resource::Location,
                ..
            }]
        ));
    }

    #[test]
    fn malformed_location_is_skipped_and_siblings_synced() {
        let partner = FakePartner::new();
        partner.reply(
            "/locations",
            Reply::json(json!({ "data": [
                { "name": "North - Hall A" },
                { "id": "loc_ok", "name": "Standalone Laundromat" },
            ]})),
        );
        partner.reply("/locations/loc_ok/machines", Reply::json(json!({ "data": [] })));
        let service = service(partner);

        let report = service.sync_all(&RunContext::manual(None)).unwrap();
        let store = service.storage();

        assert_eq!(store.count::<Location>(), 1);
        assert!(
            report
                .skipped
                .iter()
                .any(|s| matches!(s, SkipReason::Malformed { resource: Resource::Location, .. }))
        );

        // no " - " separator
        let campuses: Vec<Stored<Campus>> = store.list().unwrap();
        assert_eq!(campuses.len(), 1);
        assert_eq!(campuses[0].record.slug, UNKNOWN_CAMPUS_SLUG);
        let locations: Vec<Stored<Location>> = store.list().unwrap();
        assert_eq!(locations[0].record.campus_id, Some(campuses[0].id));
    }

    #[test]
    fn report_rows_for_unsynced_machines_are_skipped() {
        let partner = FakePartner::with_fleet(1, 1, 0);
        partner.reply(
            "/reports",
            Reply::json(json!({ "data": { "locations": [
                { "locationId": "loc_0", "machines": [
                    { "machineId": "mac_0_0", "vaultSize": 400, "totalCoins": 100 },
                    { "machineId": "mac_ghost", "vaultSize": 400 },
                ]},
            ]}})),
        );
        let service = service(partner);

        let report = service.sync_all(&RunContext::manual(None)).unwrap();
        let vaults: Vec<Stored<CoinVault>> = service.storage().list().unwrap();

        assert_eq!(vaults.len(), 1);
        assert_eq!(vaults[0].record.percent_full, Some(25.0));
        assert!(report.skipped.iter().any(|s| *s
            == SkipReason::missing_parent(Resource::CoinVault, "loc_0", Resource::Machine, "mac_ghost")));
    }

    #[test]
    fn report_keeps_only_the_requested_location_block() {
        let service = service(FakePartner::with_fleet(2, 2, 0).with_reports(2, 2));
        service.sync_all(&RunContext::manual(None)).unwrap();
        let store = service.storage();

        let machines: BTreeMap<i64, i64> = EntityStore::<Machine>::list(&**store)
            .unwrap()
            .into_iter()
            .map(|m| (m.id, m.record.location_id))
            .collect();
        let vending: Vec<Stored<AuditTotalVending>> = store.list().unwrap();
        assert_eq!(vending.len(), 4);
        for row in vending {
            assert_eq!(machines.get(&row.record.machine_id), Some(&row.record.location_id));
            assert_eq!(row.record.card_vended_cents, Some(5000));
        }
    }

    #[test]
    fn programs_only_fetched_when_enabled() {
        let partner = FakePartner::with_fleet(1, 2, 0);
        let service = service(partner.clone());
        service.sync_all(&RunContext::manual(None)).unwrap();
        assert!(!partner.paths_called().iter().any(|p| p.ends_with("/cycles")));
        assert_eq!(service.storage().count::<MachineProgram>(), 0);

        let options = SyncOptions {
            include_programs: true,
            ..SyncOptions::default()
        };
        let partner = FakePartner::with_fleet(1, 2, 0);
        let service = service_with(partner, options);
        let report = service.sync_all(&RunContext::manual(None)).unwrap();
        assert_eq!(service.storage().count::<MachineProgram>(), 4);
        assert_eq!(service.storage().count::<ProgramModifier>(), 2);
        assert_eq!(report.count(Resource::MachineProgram), 4);
    }

    #[test]
    fn machine_trigger_syncs_programs_for_stored_locations() {
        let partner = FakePartner::with_fleet(2, 1, 1);
        let service = service(partner.clone());
        service.trigger_locations(&RunContext::manual(None)).unwrap();
        let errors_before = partner.paths_called().iter().filter(|p| p.ends_with("/errors")).count();

        let report = service.trigger_machines(&RunContext::manual(None)).unwrap();
        assert_eq!(report.count(Resource::Machine), 2);
        assert_eq!(service.storage().count::<MachineProgram>(), 4);

        let programs: Vec<Stored<MachineProgram>> = service.storage().list().unwrap();
        assert!(programs.iter().all(|p| p.record.machine_type_id.is_some()));
        let errors_after = partner.paths_called().iter().filter(|p| p.ends_with("/errors")).count();
        assert_eq!(errors_before, errors_after);

        let logs = service.storage().sync_logs();
        let summary = logs.iter().find(|l| l.endpoint == "sync:machines").unwrap();
        assert_eq!(summary.program_count, 4);
    }

    #[test]
    fn error_trigger_queries_the_lookback_window_per_machine() {
        let partner = FakePartner::with_fleet(1, 2, 1);
        let service = service(partner.clone());
        service.trigger_locations(&RunContext::manual(None)).unwrap();

        let report = service.trigger_machine_errors(&RunContext::manual(None)).unwrap();
        assert_eq!(report.count(Resource::MachineError), 2);
        assert_eq!(service.storage().count::<MachineError>(), 2);

        let call = partner
            .calls()
            .into_iter()
            .rev()
            .find(|c| c.url.ends_with("/errors"))
            .unwrap();
        let param = |name: &str| {
            let raw = &call.query.iter().find(|(k, _)| k == name).unwrap().1;
            assert!(raw.ends_with('Z'), "{raw}");
            DateTime::parse_from_rfc3339(raw).unwrap()
        };
        assert_eq!(param("end") - param("start"), TimeDelta::hours(24));
    }

    #[test]
    fn error_trigger_skips_machines_whose_location_is_gone() {
        let partner = FakePartner::with_fleet(1, 1, 1);
        let service = service(partner.clone());
        service.trigger_locations(&RunContext::manual(None)).unwrap();
        service
            .storage()
            .upsert(&Machine {
                external_id: "orphan".to_string(),
                name: None,
                location_id: 999,
                machine_type_id: None,
                control_id: None,
                serial_number: None,
                model_number: None,
                status: None,
            })
            .unwrap();

        let report = service.trigger_machine_errors(&RunContext::manual(None)).unwrap();
        assert_eq!(report.count(Resource::MachineError), 1);
        assert_eq!(report.skipped.len(), 1);
        assert!(matches!(
            &report.skipped[0],
            SkipReason::MissingParent { resource: Resource::MachineError, key, parent: Resource::Location, parent_key }
                if key == "orphan" && parent_key == "999"
        ));
        assert!(!partner.paths_called().iter().any(|p| p.contains("/orphan/")));
    }

    #[test]
    fn lookback_beyond_the_date_range_skips_instead_of_panicking() {
        let huge = TimeDelta::try_hours(10_000_000_000).unwrap();
        let options = SyncOptions {
            error_lookback: huge,
            report_lookback: huge,
            ..SyncOptions::default()
        };
        let partner = FakePartner::with_fleet(1, 2, 1).with_reports(1, 2);
        let service = service_with(partner.clone(), options);

        let report = service.sync_all(&RunContext::manual(None)).unwrap();
        assert_eq!(service.storage().count::<Machine>(), 2);
        // two machines' errors plus three reports
        assert_eq!(report.skipped.len(), 5);
        assert!(report.skipped.iter().all(|s| matches!(s, SkipReason::Failed { .. })));
        let paths = partner.paths_called();
        assert!(!paths.iter().any(|p| p.ends_with("/errors") || p.ends_with("/reports")));
    }

    #[test]
    fn concurrent_run_is_rejected() {
        let service = service(FakePartner::with_fleet(1, 1, 0));
        let _held = service.run_lock.lock().unwrap();

        let err = service.sync_all(&RunContext::manual(None)).unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning));
        assert!(service.storage().list_sync_logs(&Default::default()).unwrap().is_empty());
    }
}
