//! The engine instance: clock, storage, lock manager and catalog wired
//! together with an explicit init/shutdown lifecycle. No hidden globals.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meridian_common::clock::Clock;
use meridian_common::config::EngineConfig;
use meridian_common::error::{Error, Result};
use meridian_common::key::Key;
use meridian_common::types::{TableId, Timestamp, TxnId};
use meridian_storage::catalog::{Schema, TableSchema, VersionedCatalog};
use meridian_storage::encoding::EncodedRange;
use meridian_storage::index::{IndexEntry, IndexProjector};
use meridian_storage::store::{GcStatsSnapshot, GcSweepResult, RowData, VersionedStore, Write};

use crate::lock::{LockManager, LockPriority};
use crate::read_only::{ReadOnlyTransaction, TimestampBound};
use crate::read_write::ReadWriteTransaction;

/// Transaction lifecycle counters.
#[derive(Debug, Default)]
pub(crate) struct TxnStats {
    begun: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    constraint_violations: AtomicU64,
}

impl TxnStats {
    pub(crate) fn record_begun(&self) {
        self.begun.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_aborted(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_constraint_violation(&self) {
        self.constraint_violations.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TxnStatsSnapshot {
        TxnStatsSnapshot {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            constraint_violations: self.constraint_violations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine's transaction counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnStatsSnapshot {
    pub begun: u64,
    pub committed: u64,
    pub aborted: u64,
    pub constraint_violations: u64,
}

/// An embedded database engine instance.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    clock: Arc<Clock>,
    store: Arc<VersionedStore>,
    locks: Arc<LockManager>,
    catalog: Arc<VersionedCatalog>,
    stats: Arc<TxnStats>,
    next_txn_id: AtomicU64,
    next_table_id: AtomicU64,
    shut_down: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Engine {
        let clock = Arc::new(Clock::new());
        let locks = Arc::new(LockManager::new(
            Arc::clone(&clock),
            config.lock_wait_timeout(),
        ));
        Engine {
            config,
            clock,
            store: Arc::new(VersionedStore::new()),
            locks,
            catalog: Arc::new(VersionedCatalog::new()),
            stats: Arc::new(TxnStats::default()),
            next_txn_id: AtomicU64::new(1),
            next_table_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::failed_precondition("engine is shut down"));
        }
        Ok(())
    }

    fn next_txn_id(&self) -> TxnId {
        TxnId(self.next_txn_id.fetch_add(1, Ordering::SeqCst))
    }

    fn fresh_table_id(&self) -> TableId {
        TableId(self.next_table_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Begin a snapshot read transaction at the given timestamp bound.
    pub fn begin_read_only(&self, bound: TimestampBound) -> Result<ReadOnlyTransaction> {
        self.ensure_running()?;
        let txn = ReadOnlyTransaction::new(
            self.next_txn_id(),
            bound,
            Arc::clone(&self.clock),
            Arc::clone(&self.store),
            &self.locks,
            Arc::clone(&self.catalog),
            self.config.version_gc_horizon(),
        )?;
        self.stats.record_begun();
        Ok(txn)
    }

    /// Begin a buffered-write transaction against the latest schema.
    pub fn begin_read_write(&self) -> Result<ReadWriteTransaction> {
        self.ensure_running()?;
        let schema = self
            .catalog
            .latest()
            .map(|(_, s)| s)
            .ok_or_else(|| Error::failed_precondition("no schema has been applied"))?;
        self.stats.record_begun();
        Ok(ReadWriteTransaction::new(
            self.next_txn_id(),
            Arc::clone(&self.clock),
            Arc::clone(&self.store),
            Arc::clone(&self.locks),
            Arc::clone(&self.catalog),
            schema,
            Arc::clone(&self.stats),
        ))
    }

    /// Install a new schema version. The change is itself a commit: it gets
    /// a timestamp from the lock manager, backfills data tables for indexes
    /// new in this version from the base rows visible at that timestamp, and
    /// becomes readable only once marked safe. Tables and indexes keep their
    /// storage identity across versions when their definition is unchanged.
    pub fn apply_schema(&self, mut tables: Vec<TableSchema>) -> Result<Timestamp> {
        self.ensure_running()?;
        let prev = self.catalog.latest().map(|(_, s)| s);
        let mut fresh_ids: Vec<TableId> = Vec::new();
        for table in &mut tables {
            let prev_table = prev.as_ref().and_then(|s| s.table(&table.name));
            match prev_table {
                Some(p) => table.id = p.id,
                None => {
                    table.id = self.fresh_table_id();
                    fresh_ids.push(table.id);
                }
            }
            for index in &mut table.indexes {
                let prev_index = prev_table.and_then(|p| p.find_index(&index.name));
                match prev_index {
                    Some(pi) if same_index_definition(pi, index) => {
                        index.data_table = pi.data_table;
                    }
                    _ => {
                        index.data_table = self.fresh_table_id();
                        fresh_ids.push(index.data_table);
                    }
                }
            }
        }
        let schema = Arc::new(Schema::from_tables(tables)?);
        for table in schema.tables() {
            self.store.create_table(table.id);
            for index in &table.indexes {
                self.store.create_table(index.data_table);
            }
        }

        let txn_id = self.next_txn_id();
        let handle = self.locks.create_handle(txn_id, LockPriority::READ_WRITE);
        let ts = self.locks.assign_commit_timestamp(txn_id)?;
        match self.backfill_new_indexes(&schema, ts, &fresh_ids) {
            Ok(()) => {
                while self.clock.now() < ts {
                    std::thread::sleep(Duration::from_micros(1));
                }
                self.catalog.install(ts, schema);
                self.locks.mark_safe_read(ts);
                handle.release();
                tracing::debug!(ts = %ts, "schema version installed");
                Ok(ts)
            }
            Err(e) => {
                self.locks.retract_commit(ts);
                handle.release();
                for id in fresh_ids {
                    self.store.drop_table(id);
                }
                Err(e)
            }
        }
    }

    fn backfill_new_indexes(
        &self,
        schema: &Schema,
        ts: Timestamp,
        fresh_ids: &[TableId],
    ) -> Result<()> {
        self.locks.wait_for_safe_read(ts.prev())?;
        let fresh: HashSet<TableId> = fresh_ids.iter().copied().collect();
        let mut writes: Vec<Write> = Vec::new();
        for table in schema.tables() {
            if fresh.contains(&table.id) {
                continue; // new base table, nothing to backfill
            }
            let new_indexes: Vec<_> = table
                .indexes
                .iter()
                .filter(|i| fresh.contains(&i.data_table))
                .collect();
            if new_indexes.is_empty() {
                continue;
            }
            let all: Vec<usize> = (0..table.num_columns()).collect();
            let rows: Vec<RowData> = self
                .store
                .read(ts, table.id, &EncodedRange::all(), &all)?
                .map(|(_, r)| r)
                .collect();
            for index in new_indexes {
                let projector = IndexProjector::new(table, index)?;
                let mut entries: Vec<IndexEntry> =
                    rows.iter().filter_map(|r| projector.project(r)).collect();
                if projector.unique {
                    entries.sort_by(|a, b| a.key_bytes.cmp(&b.key_bytes));
                    for pair in entries.windows(2) {
                        if projector.prefixes_collide(&pair[0].key, &pair[1].key) {
                            let prefix = Key::new(
                                pair[0].key.datums()[..projector.key_len].to_vec(),
                            );
                            return Err(Error::failed_precondition(format!(
                                "cannot create unique index {}: duplicate key {}",
                                index.name, prefix
                            )));
                        }
                    }
                }
                for entry in entries {
                    writes.push(Write {
                        table: index.data_table,
                        key: entry.key_bytes,
                        row: Some(entry.row),
                    });
                }
            }
        }
        if !writes.is_empty() {
            if let Err(e) = self.store.apply(ts, &writes) {
                panic!("storage apply failed for schema change at {}: {}", ts, e);
            }
        }
        Ok(())
    }

    /// Reclaim row versions older than the GC horizon. Reads older than the
    /// horizon already fail with `OutOfRange`, so nothing observable is lost.
    pub fn gc_sweep(&self) -> GcSweepResult {
        let safepoint = self.clock.now().sub(self.config.version_gc_horizon());
        self.store.gc_sweep(safepoint)
    }

    pub fn gc_stats(&self) -> GcStatsSnapshot {
        self.store.gc_stats()
    }

    pub fn stats(&self) -> TxnStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop admitting new transactions. Idempotent.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        tracing::debug!("engine shut down");
    }
}

fn same_index_definition(
    a: &meridian_storage::catalog::IndexSchema,
    b: &meridian_storage::catalog::IndexSchema,
) -> bool {
    a.unique == b.unique
        && a.null_filtered == b.null_filtered
        && a.key_columns.len() == b.key_columns.len()
        && a.key_columns
            .iter()
            .zip(&b.key_columns)
            .all(|(x, y)| x.column.eq_ignore_ascii_case(&y.column) && x.order == y.order)
}
