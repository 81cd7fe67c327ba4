//! Read-write transactions.
//!
//! Writes are buffered in an ordered log until commit. Commit acquires
//! exclusive locks on every written key, takes a commit timestamp, flattens
//! the buffer against the pre-state at that timestamp (enforcing the write
//! kinds' existence semantics), projects old and new index entries, checks
//! unique indexes against both the snapshot and the batch itself, installs
//! base and index writes atomically, and only then marks the timestamp
//! safe to read. Any failure aborts the whole batch; partial application is
//! never observable.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meridian_common::clock::Clock;
use meridian_common::datum::Datum;
use meridian_common::error::{Error, Result};
use meridian_common::key::{Key, KeySet};
use meridian_common::types::{TableId, Timestamp, TxnId};
use meridian_common::StatusCode;
use meridian_storage::catalog::{Schema, VersionedCatalog};
use meridian_storage::cursor::RowCursor;
use meridian_storage::encoding::{canonicalize_key_set, encode_key, prefix_scan_range, EncodedRange};
use meridian_storage::index::{IndexEntry, IndexProjector};
use meridian_storage::store::{RowData, VersionedStore, Write};

use crate::engine::TxnStats;
use crate::lock::{LockHandle, LockKey, LockManager, LockPriority};
use crate::reads::{resolve_read, ReadArg};

/// The four row-write kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Fails with `AlreadyExists` if the key is live at commit time.
    Insert,
    /// Fails with `NotFound` if the key is not live at commit time.
    Update,
    /// Inserts, or merges over the existing row preserving unspecified
    /// columns.
    InsertOrUpdate,
    /// Inserts or overwrites, resetting unspecified columns to NULL.
    Replace,
}

#[derive(Debug, Clone)]
enum MutationOp {
    Write {
        kind: WriteKind,
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Datum>>,
    },
    Delete {
        table: String,
        key_set: KeySet,
    },
}

/// A client mutation, buffered by [`ReadWriteTransaction::buffer_write`].
#[derive(Debug, Clone)]
pub struct Mutation {
    op: MutationOp,
}

impl Mutation {
    fn write(kind: WriteKind, table: impl Into<String>, columns: &[&str], rows: Vec<Vec<Datum>>) -> Mutation {
        Mutation {
            op: MutationOp::Write {
                kind,
                table: table.into(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
        }
    }

    pub fn insert(table: impl Into<String>, columns: &[&str], rows: Vec<Vec<Datum>>) -> Mutation {
        Mutation::write(WriteKind::Insert, table, columns, rows)
    }

    pub fn update(table: impl Into<String>, columns: &[&str], rows: Vec<Vec<Datum>>) -> Mutation {
        Mutation::write(WriteKind::Update, table, columns, rows)
    }

    pub fn insert_or_update(
        table: impl Into<String>,
        columns: &[&str],
        rows: Vec<Vec<Datum>>,
    ) -> Mutation {
        Mutation::write(WriteKind::InsertOrUpdate, table, columns, rows)
    }

    pub fn replace(table: impl Into<String>, columns: &[&str], rows: Vec<Vec<Datum>>) -> Mutation {
        Mutation::write(WriteKind::Replace, table, columns, rows)
    }

    pub fn delete(table: impl Into<String>, key_set: KeySet) -> Mutation {
        Mutation {
            op: MutationOp::Delete {
                table: table.into(),
                key_set,
            },
        }
    }
}

/// One validated entry of the write log.
#[derive(Debug, Clone)]
enum BufferedOp {
    Write {
        kind: WriteKind,
        table: TableId,
        key: Key,
        key_bytes: Vec<u8>,
        columns: Vec<usize>,
        values: Vec<Datum>,
    },
    Delete {
        table: TableId,
        ranges: Vec<EncodedRange>,
    },
}

/// Net effect of the write log on one row: the storage pre-state at the
/// flatten timestamp and the final post-state (`None` = tombstone).
#[derive(Debug)]
struct RowEffect {
    key: Key,
    pre: Option<RowData>,
    post: Option<RowData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlattenMode {
    /// Enforce write-kind existence semantics and NOT NULL constraints.
    Commit,
    /// Best-effort view for reads inside the transaction.
    Preview,
}

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug)]
struct RwInner {
    state: TxnState,
    log: Vec<BufferedOp>,
    handle: Option<LockHandle>,
    commit_timestamp: Option<Timestamp>,
}

/// A buffered-write transaction under strict two-phase locking. Concurrent
/// method calls on one transaction object are serialized by an internal
/// mutex; terminal states are idempotent.
#[derive(Debug)]
pub struct ReadWriteTransaction {
    id: TxnId,
    clock: Arc<Clock>,
    store: Arc<VersionedStore>,
    locks: Arc<LockManager>,
    catalog: Arc<VersionedCatalog>,
    schema: Arc<Schema>,
    stats: Arc<TxnStats>,
    cancel: Arc<AtomicBool>,
    inner: Mutex<RwInner>,
}

impl ReadWriteTransaction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: TxnId,
        clock: Arc<Clock>,
        store: Arc<VersionedStore>,
        locks: Arc<LockManager>,
        catalog: Arc<VersionedCatalog>,
        schema: Arc<Schema>,
        stats: Arc<TxnStats>,
    ) -> ReadWriteTransaction {
        let handle = locks.create_handle(id, LockPriority::READ_WRITE);
        tracing::debug!(txn = %id, "read-write transaction begun");
        ReadWriteTransaction {
            id,
            clock,
            store,
            locks,
            catalog,
            schema,
            stats,
            cancel: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(RwInner {
                state: TxnState::Active,
                log: Vec::new(),
                handle: Some(handle),
                commit_timestamp: None,
            }),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.inner.lock().state
    }

    /// Cancel the transaction: in-progress cursors fail at their next
    /// advance and the next operation aborts.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Validate a mutation against the schema snapshot and append it to the
    /// write log. Existence semantics are enforced at commit.
    pub fn buffer_write(&self, mutation: Mutation) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != TxnState::Active {
            return Err(Error::failed_precondition("transaction is not active"));
        }
        if self.cancel.load(Ordering::Acquire) {
            return Err(Error::cancelled("transaction cancelled"));
        }
        match mutation.op {
            MutationOp::Write {
                kind,
                table,
                columns,
                rows,
            } => {
                let table_schema = self.schema.table(&table).ok_or_else(|| {
                    Error::not_found(format!("table not found: {}", table))
                })?;
                let mut positions = Vec::with_capacity(columns.len());
                let mut seen = HashSet::new();
                for col in &columns {
                    let pos = table_schema.find_column(col).ok_or_else(|| {
                        Error::not_found(format!(
                            "column not found in table {}: {}",
                            table_schema.name, col
                        ))
                    })?;
                    if !seen.insert(pos) {
                        return Err(Error::invalid_argument(format!(
                            "duplicate column in mutation: {}",
                            col
                        )));
                    }
                    positions.push(pos);
                }
                let pk_orders = table_schema.pk_orders();
                for row_values in rows {
                    if row_values.len() != positions.len() {
                        return Err(Error::invalid_argument(format!(
                            "mutation on table {} names {} columns but carries {} values",
                            table_schema.name,
                            positions.len(),
                            row_values.len()
                        )));
                    }
                    for (pos, value) in positions.iter().zip(&row_values) {
                        let col = &table_schema.columns[*pos];
                        if !value.matches_type(&col.data_type) {
                            return Err(Error::invalid_argument(format!(
                                "value {} does not match type {} of column {}",
                                value, col.data_type, col.name
                            )));
                        }
                    }
                    let mut pk = Vec::with_capacity(table_schema.primary_key.len());
                    for part in &table_schema.primary_key {
                        let col = &table_schema.columns[part.column];
                        let idx = positions
                            .iter()
                            .position(|p| *p == part.column)
                            .ok_or_else(|| {
                                Error::failed_precondition(format!(
                                    "key column {} must be specified",
                                    col.name
                                ))
                            })?;
                        let value = row_values[idx].clone();
                        if value.is_null() && !col.nullable {
                            return Err(Error::failed_precondition(format!(
                                "key column {} must not be NULL",
                                col.name
                            )));
                        }
                        pk.push(value);
                    }
                    let key = Key::new(pk);
                    let key_bytes = encode_key(&key, &pk_orders);
                    inner.log.push(BufferedOp::Write {
                        kind,
                        table: table_schema.id,
                        key,
                        key_bytes,
                        columns: positions.clone(),
                        values: row_values,
                    });
                }
            }
            MutationOp::Delete { table, key_set } => {
                let table_schema = self.schema.table(&table).ok_or_else(|| {
                    Error::not_found(format!("table not found: {}", table))
                })?;
                let ranges = canonicalize_key_set(
                    &key_set,
                    &table_schema.pk_types(),
                    &table_schema.pk_orders(),
                )?;
                inner.log.push(BufferedOp::Delete {
                    table: table_schema.id,
                    ranges,
                });
            }
        }
        Ok(())
    }

    /// Read at the current time, with the transaction's own buffered writes
    /// layered over storage. Shared locks are taken on every row read.
    pub fn read(&self, arg: &ReadArg) -> Result<RowCursor> {
        let inner = self.inner.lock();
        if inner.state != TxnState::Active {
            return Err(Error::failed_precondition("transaction is not active"));
        }
        if self.cancel.load(Ordering::Acquire) {
            return Err(Error::cancelled("transaction cancelled"));
        }
        let now = self.clock.now();
        let resolved = resolve_read(&self.schema, arg)?;
        let ranges =
            canonicalize_key_set(&arg.key_set, &resolved.key_types, &resolved.key_orders)?;
        let effects = flatten_log(
            &inner.log,
            &self.schema,
            &self.store,
            now,
            FlattenMode::Preview,
        )?;
        let table = self
            .schema
            .table(&arg.table)
            .ok_or_else(|| Error::not_found(format!("table not found: {}", arg.table)))?;
        let handle = inner
            .handle
            .as_ref()
            .ok_or_else(|| Error::internal("transaction lost its lock handle"))?;

        let mut merged: BTreeMap<Vec<u8>, RowData> = BTreeMap::new();
        match &arg.index {
            None => {
                let all: Vec<usize> = (0..table.num_columns()).collect();
                for range in &ranges {
                    for (kb, row) in self.store.read(now, table.id, range, &all)? {
                        merged.insert(kb, row);
                    }
                }
                for ((tid, kb), eff) in &effects {
                    if *tid != table.id || !ranges.iter().any(|r| r.contains(kb)) {
                        continue;
                    }
                    match &eff.post {
                        Some(row) => {
                            merged.insert(kb.clone(), row.clone());
                        }
                        None => {
                            merged.remove(kb);
                        }
                    }
                }
                let lock_keys: Vec<LockKey> =
                    merged.keys().map(|kb| (table.id, kb.clone())).collect();
                handle.acquire_shared(&lock_keys)?;
            }
            Some(index_name) => {
                let index = table.find_index(index_name).ok_or_else(|| {
                    Error::not_found(format!(
                        "index not found on table {}: {}",
                        table.name, index_name
                    ))
                })?;
                let projector = IndexProjector::new(table, index)?;
                let entry_width = index.key_columns.len() + table.primary_key.len();
                let all: Vec<usize> = (0..entry_width).collect();
                for range in &ranges {
                    for (kb, row) in self.store.read(now, index.data_table, range, &all)? {
                        merged.insert(kb, row);
                    }
                }
                for ((tid, _), eff) in &effects {
                    if *tid != table.id {
                        continue;
                    }
                    if let Some(old) = eff.pre.as_ref().and_then(|r| projector.project(r)) {
                        merged.remove(&old.key_bytes);
                    }
                    if let Some(new) = eff.post.as_ref().and_then(|r| projector.project(r)) {
                        if ranges.iter().any(|r| r.contains(&new.key_bytes)) {
                            merged.insert(new.key_bytes.clone(), new.row);
                        }
                    }
                }
                let pk_len = table.primary_key.len();
                let pk_orders = table.pk_orders();
                let mut lock_keys = Vec::with_capacity(merged.len());
                for row in merged.values() {
                    let tail = Key::new(row[row.len() - pk_len..].to_vec());
                    lock_keys.push((table.id, encode_key(&tail, &pk_orders)));
                }
                handle.acquire_shared(&lock_keys)?;
            }
        }

        let rows: Vec<Vec<Datum>> = merged
            .values()
            .map(|row| {
                resolved
                    .positions
                    .iter()
                    .map(|&i| row.get(i).cloned().unwrap_or(Datum::Null))
                    .collect()
            })
            .collect();
        Ok(RowCursor::new(resolved.columns, rows, self.cancel.clone()))
    }

    /// Commit the buffered writes. Returns the commit timestamp. Idempotent
    /// once committed; any failure aborts the whole transaction.
    pub fn commit(&self) -> Result<Timestamp> {
        let mut inner = self.inner.lock();
        match inner.state {
            TxnState::Committed => {
                return inner
                    .commit_timestamp
                    .ok_or_else(|| Error::internal("committed transaction lost its timestamp"));
            }
            TxnState::Aborted => {
                return Err(Error::failed_precondition("transaction was rolled back"));
            }
            TxnState::Active => {}
        }
        if self.cancel.load(Ordering::Acquire) {
            self.finish_abort(&mut inner);
            return Err(Error::cancelled("transaction cancelled"));
        }
        match self.commit_locked(&mut inner) {
            Ok(ts) => {
                inner.state = TxnState::Committed;
                inner.commit_timestamp = Some(ts);
                if let Some(handle) = inner.handle.take() {
                    handle.release();
                }
                self.stats.record_committed();
                tracing::debug!(txn = %self.id, ts = %ts, "transaction committed");
                Ok(ts)
            }
            Err(e) => {
                self.finish_abort(&mut inner);
                if e.code() == StatusCode::AlreadyExists {
                    self.stats.record_constraint_violation();
                }
                self.stats.record_aborted();
                tracing::debug!(txn = %self.id, error = %e, "transaction aborted at commit");
                Err(e)
            }
        }
    }

    /// Abort the transaction, releasing locks and discarding the buffer.
    /// Idempotent.
    pub fn rollback(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            TxnState::Aborted => Ok(()),
            TxnState::Committed => Err(Error::failed_precondition(
                "transaction was already committed",
            )),
            TxnState::Active => {
                self.finish_abort(&mut inner);
                self.stats.record_aborted();
                tracing::debug!(txn = %self.id, "transaction rolled back");
                Ok(())
            }
        }
    }

    fn finish_abort(&self, inner: &mut RwInner) {
        inner.state = TxnState::Aborted;
        inner.log.clear();
        if let Some(handle) = inner.handle.take() {
            handle.release();
        }
    }

    fn commit_locked(&self, inner: &mut RwInner) -> Result<Timestamp> {
        // Phase 1: exclusive locks on every key the log writes. Keys inside
        // delete ranges are enumerated at the current time; anything that
        // slips in before the commit timestamp is locked during flattening.
        let now = self.clock.now();
        let mut keys: BTreeSet<LockKey> = BTreeSet::new();
        for op in &inner.log {
            match op {
                BufferedOp::Write {
                    table, key_bytes, ..
                } => {
                    keys.insert((*table, key_bytes.clone()));
                }
                BufferedOp::Delete { table, ranges } => {
                    for range in ranges {
                        for kb in self.store.visible_keys(now, *table, range)? {
                            keys.insert((*table, kb));
                        }
                    }
                }
            }
        }
        {
            let handle = inner
                .handle
                .as_ref()
                .ok_or_else(|| Error::internal("transaction lost its lock handle"))?;
            let key_vec: Vec<LockKey> = keys.iter().cloned().collect();
            handle.acquire_exclusive(&key_vec)?;
        }
        let mut locked = keys;

        // Phase 2: commit timestamp.
        let ts = self.locks.assign_commit_timestamp(self.id)?;
        let result = self.commit_at(inner, ts, &mut locked);
        if result.is_err() {
            self.locks.retract_commit(ts);
        }
        result.map(|_| ts)
    }

    fn commit_at(
        &self,
        inner: &RwInner,
        ts: Timestamp,
        locked: &mut BTreeSet<LockKey>,
    ) -> Result<()> {
        // Every commit ordered before ours must be fully applied before we
        // read the snapshot at `ts`: flattening, index projection and the
        // uniqueness checks all depend on it.
        self.locks.wait_for_safe_read(ts.prev())?;

        // A schema change invalidates the snapshot this transaction was
        // validated against.
        let schema_now = self
            .catalog
            .schema_at(ts)
            .ok_or_else(|| Error::internal("no schema at commit timestamp"))?;
        if !Arc::ptr_eq(&schema_now, &self.schema) {
            return Err(Error::aborted("schema changed during transaction"));
        }

        let effects = flatten_log(
            &inner.log,
            &self.schema,
            &self.store,
            ts,
            FlattenMode::Commit,
        )?;

        let handle = inner
            .handle
            .as_ref()
            .ok_or_else(|| Error::internal("transaction lost its lock handle"))?;
        let stray: Vec<LockKey> = effects
            .keys()
            .filter(|k| !locked.contains(*k))
            .cloned()
            .collect();
        if !stray.is_empty() {
            handle.acquire_exclusive(&stray)?;
            locked.extend(stray);
        }

        let mut writes: Vec<Write> = Vec::new();
        for ((table, kb), eff) in &effects {
            // Deleting a key that never existed writes nothing.
            if eff.pre.is_none() && eff.post.is_none() {
                continue;
            }
            writes.push(Write {
                table: *table,
                key: kb.clone(),
                row: eff.post.clone(),
            });
        }
        writes.extend(compute_index_writes(
            &self.schema,
            &self.store,
            &effects,
            ts,
        )?);

        if let Err(e) = self.store.apply(ts, &writes) {
            // Storage disagreeing with the lock manager is unrecoverable:
            // continuing would expose a corrupted snapshot.
            panic!("storage apply failed for commit {}: {}", ts, e);
        }

        // The commit timestamp must be in the past before it becomes
        // visible.
        while self.clock.now() < ts {
            std::thread::sleep(Duration::from_micros(1));
        }
        self.locks.mark_safe_read(ts);
        Ok(())
    }
}

/// Replay the write log over the storage state at `ts`, producing the net
/// per-row effect. Later operations see the effects of earlier ones.
fn flatten_log(
    log: &[BufferedOp],
    schema: &Schema,
    store: &VersionedStore,
    ts: Timestamp,
    mode: FlattenMode,
) -> Result<BTreeMap<(TableId, Vec<u8>), RowEffect>> {
    let mut effects: BTreeMap<(TableId, Vec<u8>), RowEffect> = BTreeMap::new();
    for op in log {
        match op {
            BufferedOp::Write {
                kind,
                table,
                key,
                key_bytes,
                columns,
                values,
            } => {
                let table_schema = schema
                    .table_by_id(*table)
                    .ok_or_else(|| Error::internal(format!("unknown table {} in write log", table)))?;
                let effect_key = (*table, key_bytes.clone());
                if !effects.contains_key(&effect_key) {
                    let pre = store.read_row(ts, *table, key_bytes)?;
                    effects.insert(
                        effect_key.clone(),
                        RowEffect {
                            key: key.clone(),
                            pre: pre.clone(),
                            post: pre,
                        },
                    );
                }
                let current = effects
                    .get(&effect_key)
                    .and_then(|e| e.post.clone());
                let base = match kind {
                    WriteKind::Insert => {
                        if current.is_some() && mode == FlattenMode::Commit {
                            return Err(Error::already_exists(format!(
                                "row already exists in table {}: key {}",
                                table_schema.name, key
                            )));
                        }
                        None
                    }
                    WriteKind::Update => match current {
                        Some(row) => Some(row),
                        None => {
                            if mode == FlattenMode::Commit {
                                return Err(Error::not_found(format!(
                                    "row not found in table {}: key {}",
                                    table_schema.name, key
                                )));
                            }
                            continue;
                        }
                    },
                    WriteKind::InsertOrUpdate => current,
                    WriteKind::Replace => None,
                };
                let ncols = table_schema.num_columns();
                let mut row = base.unwrap_or_else(|| vec![Datum::Null; ncols]);
                row.resize(ncols, Datum::Null);
                for (pos, value) in columns.iter().zip(values.iter()) {
                    row[*pos] = value.clone();
                }
                if mode == FlattenMode::Commit {
                    for (i, col) in table_schema.columns.iter().enumerate() {
                        if !col.nullable && row[i].is_null() {
                            return Err(Error::failed_precondition(format!(
                                "column {} in table {} must not be NULL",
                                col.name, table_schema.name
                            )));
                        }
                    }
                }
                if let Some(eff) = effects.get_mut(&effect_key) {
                    eff.post = Some(row);
                }
            }
            BufferedOp::Delete { table, ranges } => {
                let table_schema = schema
                    .table_by_id(*table)
                    .ok_or_else(|| Error::internal(format!("unknown table {} in write log", table)))?;
                for range in ranges {
                    for kb in store.visible_keys(ts, *table, range)? {
                        let effect_key = (*table, kb.clone());
                        if let Some(eff) = effects.get_mut(&effect_key) {
                            eff.post = None;
                        } else {
                            let pre = store.read_row(ts, *table, &kb)?;
                            let key = pre
                                .as_ref()
                                .map(|r| table_schema.extract_pk(r))
                                .unwrap_or_default();
                            effects.insert(
                                effect_key,
                                RowEffect {
                                    key,
                                    pre,
                                    post: None,
                                },
                            );
                        }
                    }
                    // Rows this transaction created earlier in the buffer.
                    let buffered: Vec<(TableId, Vec<u8>)> = effects
                        .iter()
                        .filter(|((t, kb), eff)| {
                            *t == *table && eff.post.is_some() && range.contains(kb)
                        })
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in buffered {
                        if let Some(eff) = effects.get_mut(&k) {
                            eff.post = None;
                        }
                    }
                }
            }
        }
    }
    Ok(effects)
}

struct IndexDelta {
    projector: IndexProjector,
    removed: HashSet<Vec<u8>>,
    added: Vec<IndexEntry>,
}

/// Derive the index writes for a commit batch and run the uniqueness checks
/// against the snapshot at `ts` and within the batch itself.
fn compute_index_writes(
    schema: &Schema,
    store: &VersionedStore,
    effects: &BTreeMap<(TableId, Vec<u8>), RowEffect>,
    ts: Timestamp,
) -> Result<Vec<Write>> {
    let table_ids: BTreeSet<TableId> = effects.keys().map(|(t, _)| *t).collect();
    let mut deltas: Vec<IndexDelta> = Vec::new();
    for table_id in table_ids {
        let table = schema
            .table_by_id(table_id)
            .ok_or_else(|| Error::internal(format!("unknown table {} in commit batch", table_id)))?;
        for index in &table.indexes {
            let projector = IndexProjector::new(table, index)?;
            let mut removed = HashSet::new();
            let mut added = Vec::new();
            for ((t, _), eff) in effects.iter() {
                if *t != table_id {
                    continue;
                }
                let old = eff.pre.as_ref().and_then(|r| projector.project(r));
                let new = eff.post.as_ref().and_then(|r| projector.project(r));
                match (old, new) {
                    (Some(o), Some(n)) => {
                        // An unchanged entry is not rewritten.
                        if o.key_bytes != n.key_bytes {
                            removed.insert(o.key_bytes);
                            added.push(n);
                        }
                    }
                    (Some(o), None) => {
                        removed.insert(o.key_bytes);
                    }
                    (None, Some(n)) => added.push(n),
                    (None, None) => {}
                }
            }
            deltas.push(IndexDelta {
                projector,
                removed,
                added,
            });
        }
    }

    for delta in &deltas {
        if !delta.projector.unique {
            continue;
        }
        // Conflicts among the pending writes themselves.
        for (i, a) in delta.added.iter().enumerate() {
            for b in delta.added.iter().skip(i + 1) {
                if delta.projector.prefixes_collide(&a.key, &b.key) {
                    return Err(unique_violation(&delta.projector, &a.key));
                }
            }
        }
        // Conflicts against live entries at the commit timestamp. An entry
        // belonging to a base row whose old entry this batch removes is not
        // a conflict.
        for entry in &delta.added {
            let prefix = delta.projector.prefix_bytes(&entry.key);
            let range = prefix_scan_range(&prefix);
            for (kb, _) in store.read(ts, delta.projector.data_table, &range, &[])? {
                if kb == entry.key_bytes || delta.removed.contains(&kb) {
                    continue;
                }
                return Err(unique_violation(&delta.projector, &entry.key));
            }
        }
    }

    let mut writes = Vec::new();
    for delta in deltas {
        let data_table = delta.projector.data_table;
        for kb in delta.removed {
            writes.push(Write {
                table: data_table,
                key: kb,
                row: None,
            });
        }
        for entry in delta.added {
            writes.push(Write {
                table: data_table,
                key: entry.key_bytes,
                row: Some(entry.row),
            });
        }
    }
    Ok(writes)
}

fn unique_violation(projector: &IndexProjector, entry_key: &Key) -> Error {
    let prefix = Key::new(entry_key.datums()[..projector.key_len].to_vec());
    Error::already_exists(format!(
        "unique index {} already contains key {}",
        projector.index_name, prefix
    ))
}
