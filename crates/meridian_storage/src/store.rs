//! Multi-version row storage.
//!
//! Logically a mapping `(table, encoded key) -> ordered list of
//! (commit_timestamp, row | tombstone)`, newest first. Versions enter the
//! store only through `apply` at commit time, so every version in a chain is
//! committed and chains are strictly timestamp-descending.
//!
//! Visibility: a read at `ts` observes, per key, the version with the largest
//! commit timestamp `<= ts`; a tombstone hides the key. Readers whose
//! timestamp covers an in-flight commit are fenced by the lock layer's
//! safe-read registry before they reach storage, so `apply` does not need to
//! be atomic across tables with respect to those readers.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use meridian_common::datum::Datum;
use meridian_common::error::{Error, Result};
use meridian_common::types::{TableId, Timestamp};

use crate::encoding::EncodedRange;

/// A full row: one value per table column, in declared column order.
pub type RowData = Vec<Datum>;

/// One write of a commit batch: a new row version or a tombstone.
#[derive(Debug, Clone)]
pub struct Write {
    pub table: TableId,
    pub key: Vec<u8>,
    pub row: Option<RowData>,
}

#[derive(Debug)]
struct ChainVersion {
    ts: Timestamp,
    /// `None` is a tombstone.
    row: Option<Arc<RowData>>,
}

/// Version chain for a single key, newest first.
#[derive(Debug, Default)]
struct VersionChain {
    versions: Vec<ChainVersion>,
}

impl VersionChain {
    fn install(&mut self, ts: Timestamp, row: Option<RowData>) {
        // Commits are applied in timestamp order per key, but a commit may
        // install below a concurrent later commit that already applied.
        let pos = self.versions.partition_point(|v| v.ts > ts);
        debug_assert!(
            self.versions.get(pos).map_or(true, |v| v.ts != ts),
            "one commit timestamp per key version"
        );
        self.versions.insert(
            pos,
            ChainVersion {
                ts,
                row: row.map(Arc::new),
            },
        );
    }

    /// The row visible at `ts`, or `None` for a tombstone or no version.
    fn row_at(&self, ts: Timestamp) -> Option<Arc<RowData>> {
        self.versions
            .iter()
            .find(|v| v.ts <= ts)
            .and_then(|v| v.row.clone())
    }

    /// Drop versions no reader can observe anymore: everything older than the
    /// newest version at or below the safepoint, plus a trailing tombstone.
    /// Returns (reclaimed versions, chain now empty).
    fn gc(&mut self, safepoint: Timestamp) -> (u64, bool) {
        let mut reclaimed = 0u64;
        if let Some(pos) = self.versions.iter().position(|v| v.ts <= safepoint) {
            reclaimed += (self.versions.len() - pos - 1) as u64;
            self.versions.truncate(pos + 1);
            // A tombstone with nothing older behaves exactly like no version.
            if self.versions.last().map_or(false, |v| v.row.is_none()) {
                self.versions.pop();
                reclaimed += 1;
            }
        }
        (reclaimed, self.versions.is_empty())
    }
}

#[derive(Debug, Default)]
struct TableRows {
    rows: RwLock<BTreeMap<Vec<u8>, VersionChain>>,
}

/// Result of a single GC sweep across all tables.
#[derive(Debug, Clone, Default)]
pub struct GcSweepResult {
    pub chains_inspected: u64,
    pub chains_pruned: u64,
    pub reclaimed_versions: u64,
    pub chains_removed: u64,
    pub safepoint: Timestamp,
}

/// Cumulative GC statistics (atomic, lock-free).
#[derive(Debug, Default)]
pub struct GcStats {
    total_sweeps: AtomicU64,
    total_reclaimed_versions: AtomicU64,
    total_chains_pruned: AtomicU64,
    last_safepoint: AtomicI64,
}

/// Point-in-time copy of [`GcStats`].
#[derive(Debug, Clone, Default)]
pub struct GcStatsSnapshot {
    pub total_sweeps: u64,
    pub total_reclaimed_versions: u64,
    pub total_chains_pruned: u64,
    pub last_safepoint: Timestamp,
}

impl GcStats {
    fn record_sweep(&self, result: &GcSweepResult) {
        self.total_sweeps.fetch_add(1, Ordering::Relaxed);
        self.total_reclaimed_versions
            .fetch_add(result.reclaimed_versions, Ordering::Relaxed);
        self.total_chains_pruned
            .fetch_add(result.chains_pruned, Ordering::Relaxed);
        self.last_safepoint
            .store(result.safepoint.0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GcStatsSnapshot {
        GcStatsSnapshot {
            total_sweeps: self.total_sweeps.load(Ordering::Relaxed),
            total_reclaimed_versions: self.total_reclaimed_versions.load(Ordering::Relaxed),
            total_chains_pruned: self.total_chains_pruned.load(Ordering::Relaxed),
            last_safepoint: Timestamp(self.last_safepoint.load(Ordering::Relaxed)),
        }
    }
}

/// Single-pass, forward-only iterator over the rows of one scanned range.
/// Restartable only by re-issuing the read.
#[derive(Debug)]
pub struct StoreIter {
    rows: std::vec::IntoIter<(Vec<u8>, Vec<Datum>)>,
}

impl StoreIter {
    fn new(rows: Vec<(Vec<u8>, Vec<Datum>)>) -> Self {
        StoreIter {
            rows: rows.into_iter(),
        }
    }

    pub fn empty() -> Self {
        StoreIter::new(Vec::new())
    }
}

impl Iterator for StoreIter {
    type Item = (Vec<u8>, Vec<Datum>);

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

/// Process-wide multi-version store: one ordered row map per table id.
/// Index data tables are ordinary tables here.
#[derive(Debug, Default)]
pub struct VersionedStore {
    tables: DashMap<TableId, Arc<TableRows>>,
    gc_stats: GcStats,
}

impl VersionedStore {
    pub fn new() -> Self {
        VersionedStore::default()
    }

    /// Register a table. Idempotent.
    pub fn create_table(&self, id: TableId) {
        self.tables.entry(id).or_default();
    }

    pub fn drop_table(&self, id: TableId) {
        self.tables.remove(&id);
    }

    pub fn has_table(&self, id: TableId) -> bool {
        self.tables.contains_key(&id)
    }

    fn table(&self, id: TableId) -> Result<Arc<TableRows>> {
        self.tables
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::internal(format!("no storage registered for {}", id)))
    }

    /// Scan rows with keys in `range` visible at `ts`, ascending by encoded
    /// key, projecting `columns` (positions into the stored row). Missing
    /// positions read as NULL.
    pub fn read(
        &self,
        ts: Timestamp,
        table: TableId,
        range: &EncodedRange,
        columns: &[usize],
    ) -> Result<StoreIter> {
        let t = self.table(table)?;
        if range.is_empty() {
            return Ok(StoreIter::empty());
        }
        let rows = t.rows.read();
        let mut out = Vec::new();
        for (key, chain) in rows.range((range.start.clone(), range.end.clone())) {
            if let Some(row) = chain.row_at(ts) {
                out.push((key.clone(), project(&row, columns)));
            }
        }
        Ok(StoreIter::new(out))
    }

    /// Point lookup of the full row visible at `ts`.
    pub fn read_row(&self, ts: Timestamp, table: TableId, key: &[u8]) -> Result<Option<RowData>> {
        let t = self.table(table)?;
        let rows = t.rows.read();
        Ok(rows
            .get(key)
            .and_then(|chain| chain.row_at(ts))
            .map(|row| (*row).clone()))
    }

    /// Whether a live (non-tombstone) row exists for `key` at `ts`.
    pub fn row_exists(&self, ts: Timestamp, table: TableId, key: &[u8]) -> Result<bool> {
        let t = self.table(table)?;
        let rows = t.rows.read();
        Ok(rows.get(key).and_then(|chain| chain.row_at(ts)).is_some())
    }

    /// Keys of rows visible at `ts` within `range`, ascending.
    pub fn visible_keys(
        &self,
        ts: Timestamp,
        table: TableId,
        range: &EncodedRange,
    ) -> Result<Vec<Vec<u8>>> {
        let t = self.table(table)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let rows = t.rows.read();
        Ok(rows
            .range((range.start.clone(), range.end.clone()))
            .filter(|(_, chain)| chain.row_at(ts).is_some())
            .map(|(key, _)| key.clone())
            .collect())
    }

    /// Install a commit batch at `commit_ts`. Callers hold exclusive locks on
    /// every written key and have been assigned `commit_ts` by the lock
    /// layer, which guarantees per-key timestamp monotonicity.
    pub fn apply(&self, commit_ts: Timestamp, writes: &[Write]) -> Result<()> {
        let mut by_table: BTreeMap<TableId, Vec<&Write>> = BTreeMap::new();
        for write in writes {
            by_table.entry(write.table).or_default().push(write);
        }
        for (table_id, table_writes) in by_table {
            let t = self.table(table_id)?;
            let mut rows = t.rows.write();
            for write in table_writes {
                rows.entry(write.key.clone())
                    .or_default()
                    .install(commit_ts, write.row.clone());
            }
        }
        Ok(())
    }

    /// Reclaim versions that no read at or after `safepoint` can observe.
    pub fn gc_sweep(&self, safepoint: Timestamp) -> GcSweepResult {
        let mut result = GcSweepResult {
            safepoint,
            ..GcSweepResult::default()
        };
        let tables: Vec<Arc<TableRows>> =
            self.tables.iter().map(|e| e.value().clone()).collect();
        for t in tables {
            let mut rows = t.rows.write();
            let mut emptied: Vec<Vec<u8>> = Vec::new();
            for (key, chain) in rows.iter_mut() {
                result.chains_inspected += 1;
                let (reclaimed, now_empty) = chain.gc(safepoint);
                if reclaimed > 0 {
                    result.reclaimed_versions += reclaimed;
                    result.chains_pruned += 1;
                }
                if now_empty {
                    emptied.push(key.clone());
                }
            }
            result.chains_removed += emptied.len() as u64;
            for key in emptied {
                rows.remove(&key);
            }
        }
        self.gc_stats.record_sweep(&result);
        tracing::debug!(
            safepoint = %safepoint,
            reclaimed = result.reclaimed_versions,
            pruned = result.chains_pruned,
            "gc sweep complete"
        );
        result
    }

    pub fn gc_stats(&self) -> GcStatsSnapshot {
        self.gc_stats.snapshot()
    }
}

fn project(row: &RowData, columns: &[usize]) -> Vec<Datum> {
    columns
        .iter()
        .map(|&i| row.get(i).cloned().unwrap_or(Datum::Null))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_key;
    use meridian_common::key::{Key, SortOrder};

    fn k(id: i64) -> Vec<u8> {
        encode_key(&Key::new(vec![Datum::Int64(id)]), &[SortOrder::Ascending])
    }

    fn row(id: i64, name: &str) -> RowData {
        vec![Datum::Int64(id), Datum::Text(name.into())]
    }

    fn store_with_table() -> VersionedStore {
        let store = VersionedStore::new();
        store.create_table(TableId(1));
        store
    }

    #[test]
    fn test_read_sees_version_at_or_before_timestamp() {
        let store = store_with_table();
        store
            .apply(
                Timestamp(10),
                &[Write {
                    table: TableId(1),
                    key: k(1),
                    row: Some(row(1, "a")),
                }],
            )
            .unwrap();
        store
            .apply(
                Timestamp(20),
                &[Write {
                    table: TableId(1),
                    key: k(1),
                    row: Some(row(1, "b")),
                }],
            )
            .unwrap();

        assert_eq!(store.read_row(Timestamp(9), TableId(1), &k(1)).unwrap(), None);
        assert_eq!(
            store.read_row(Timestamp(10), TableId(1), &k(1)).unwrap(),
            Some(row(1, "a"))
        );
        assert_eq!(
            store.read_row(Timestamp(15), TableId(1), &k(1)).unwrap(),
            Some(row(1, "a"))
        );
        assert_eq!(
            store.read_row(Timestamp(25), TableId(1), &k(1)).unwrap(),
            Some(row(1, "b"))
        );
    }

    #[test]
    fn test_tombstone_hides_row() {
        let store = store_with_table();
        store
            .apply(
                Timestamp(10),
                &[Write {
                    table: TableId(1),
                    key: k(1),
                    row: Some(row(1, "a")),
                }],
            )
            .unwrap();
        store
            .apply(
                Timestamp(20),
                &[Write {
                    table: TableId(1),
                    key: k(1),
                    row: None,
                }],
            )
            .unwrap();

        assert!(store.row_exists(Timestamp(15), TableId(1), &k(1)).unwrap());
        assert!(!store.row_exists(Timestamp(20), TableId(1), &k(1)).unwrap());
        assert!(!store.row_exists(Timestamp(99), TableId(1), &k(1)).unwrap());
    }

    #[test]
    fn test_scan_is_key_ascending() {
        let store = store_with_table();
        let writes: Vec<Write> = [3, 1, 2]
            .iter()
            .map(|&id| Write {
                table: TableId(1),
                key: k(id),
                row: Some(row(id, "x")),
            })
            .collect();
        store.apply(Timestamp(10), &writes).unwrap();

        let got: Vec<i64> = store
            .read(Timestamp(10), TableId(1), &EncodedRange::all(), &[0])
            .unwrap()
            .map(|(_, cols)| cols[0].as_i64().unwrap())
            .collect();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn test_projection_missing_column_is_null() {
        let store = store_with_table();
        store
            .apply(
                Timestamp(10),
                &[Write {
                    table: TableId(1),
                    key: k(1),
                    row: Some(row(1, "a")),
                }],
            )
            .unwrap();
        let rows: Vec<_> = store
            .read(Timestamp(10), TableId(1), &EncodedRange::all(), &[1, 5])
            .unwrap()
            .collect();
        assert_eq!(rows[0].1, vec![Datum::Text("a".into()), Datum::Null]);
    }

    #[test]
    fn test_gc_reclaims_shadowed_versions() {
        let store = store_with_table();
        for (ts, name) in [(10, "a"), (20, "b"), (30, "c")] {
            store
                .apply(
                    Timestamp(ts),
                    &[Write {
                        table: TableId(1),
                        key: k(1),
                        row: Some(row(1, name)),
                    }],
                )
                .unwrap();
        }
        let result = store.gc_sweep(Timestamp(25));
        assert_eq!(result.reclaimed_versions, 1); // ts=10 shadowed by ts=20
        assert_eq!(
            store.read_row(Timestamp(25), TableId(1), &k(1)).unwrap(),
            Some(row(1, "b"))
        );
        assert_eq!(
            store.read_row(Timestamp(30), TableId(1), &k(1)).unwrap(),
            Some(row(1, "c"))
        );
    }

    #[test]
    fn test_gc_removes_dead_tombstone_chain() {
        let store = store_with_table();
        store
            .apply(
                Timestamp(10),
                &[Write {
                    table: TableId(1),
                    key: k(1),
                    row: Some(row(1, "a")),
                }],
            )
            .unwrap();
        store
            .apply(
                Timestamp(20),
                &[Write {
                    table: TableId(1),
                    key: k(1),
                    row: None,
                }],
            )
            .unwrap();
        let result = store.gc_sweep(Timestamp(50));
        assert_eq!(result.chains_removed, 1);
        assert_eq!(result.reclaimed_versions, 2);
        assert!(!store.row_exists(Timestamp(99), TableId(1), &k(1)).unwrap());
        let stats = store.gc_stats();
        assert_eq!(stats.total_sweeps, 1);
        assert_eq!(stats.last_safepoint, Timestamp(50));
    }

    #[test]
    fn test_gc_keeps_versions_newer_than_safepoint() {
        let store = store_with_table();
        for ts in [10, 20, 30] {
            store
                .apply(
                    Timestamp(ts),
                    &[Write {
                        table: TableId(1),
                        key: k(1),
                        row: Some(row(1, "v")),
                    }],
                )
                .unwrap();
        }
        let result = store.gc_sweep(Timestamp(5));
        assert_eq!(result.reclaimed_versions, 0);
    }
}
