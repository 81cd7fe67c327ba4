//! Snapshot (read-only) transactions.
//!
//! A read-only transaction fixes its read timestamp at creation from one of
//! five staleness bounds and never blocks writers: the only waiting it does
//! is the safe-read fence, deferred to the first read, which lets every
//! commit at or before the chosen timestamp finish applying.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meridian_common::clock::Clock;
use meridian_common::error::{Error, Result};
use meridian_common::types::{Timestamp, TxnId};
use meridian_storage::catalog::{Schema, VersionedCatalog};
use meridian_storage::cursor::RowCursor;
use meridian_storage::encoding::canonicalize_key_set;
use meridian_storage::store::VersionedStore;

use crate::lock::{LockHandle, LockManager, LockPriority};
use crate::reads::{resolve_read, ReadArg};

/// How a read-only transaction picks its read timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampBound {
    /// Read at the current time: observes everything committed so far.
    Strong,
    /// Read at exactly the given timestamp.
    ExactTimestamp(Timestamp),
    /// Read at exactly `now - staleness`.
    ExactStaleness(Duration),
    /// Read at some timestamp at or after the given one. The exact point is
    /// randomized to model reading from a lagging replica.
    MinTimestamp(Timestamp),
    /// Read at some timestamp at most this stale, randomized likewise.
    MaxStaleness(Duration),
}

#[derive(Debug)]
struct RoInner {
    fenced: bool,
    schema: Arc<Schema>,
}

/// A transaction reading a fixed consistent snapshot. Concurrent method
/// calls on one transaction object are serialized by an internal mutex.
#[derive(Debug)]
pub struct ReadOnlyTransaction {
    id: TxnId,
    read_timestamp: Timestamp,
    store: Arc<VersionedStore>,
    catalog: Arc<VersionedCatalog>,
    handle: LockHandle,
    clock: Arc<Clock>,
    gc_horizon: Duration,
    cancel: Arc<AtomicBool>,
    inner: Mutex<RoInner>,
}

impl ReadOnlyTransaction {
    pub(crate) fn new(
        id: TxnId,
        bound: TimestampBound,
        clock: Arc<Clock>,
        store: Arc<VersionedStore>,
        locks: &Arc<LockManager>,
        catalog: Arc<VersionedCatalog>,
        gc_horizon: Duration,
    ) -> Result<ReadOnlyTransaction> {
        let handle = locks.create_handle(id, LockPriority::READ_ONLY);
        let read_timestamp = pick_read_timestamp(bound, &clock, locks);
        let schema = catalog.schema_at(read_timestamp).ok_or_else(|| {
            Error::failed_precondition(format!("no schema exists at {}", read_timestamp))
        })?;
        tracing::debug!(txn = %id, ts = %read_timestamp, "read-only transaction begun");
        Ok(ReadOnlyTransaction {
            id,
            read_timestamp,
            store,
            catalog,
            handle,
            clock,
            gc_horizon,
            cancel: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(RoInner {
                fenced: false,
                schema,
            }),
        })
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn read_timestamp(&self) -> Timestamp {
        self.read_timestamp
    }

    /// Cancel the transaction: in-progress cursors fail at their next
    /// advance, and further reads are rejected.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    /// Execute a snapshot read and return a row cursor.
    ///
    /// The read timestamp was fixed at creation; staleness accrues over the
    /// transaction's lifetime, and a read older than the GC horizon fails
    /// with `OutOfRange`.
    pub fn read(&self, arg: &ReadArg) -> Result<RowCursor> {
        let mut inner = self.inner.lock();
        if self.cancel.load(Ordering::Acquire) {
            return Err(Error::cancelled("transaction cancelled"));
        }
        let now = self.clock.now();
        if now.since(self.read_timestamp) >= self.gc_horizon {
            return Err(Error::out_of_range(format!(
                "read timestamp {} is past the version garbage collection horizon",
                self.read_timestamp
            )));
        }
        if !inner.fenced {
            // Let every commit at or before our snapshot finish applying.
            self.handle.wait_for_safe_read(self.read_timestamp)?;
            // A schema commit at or before our timestamp may have landed
            // after construction; the fence makes this lookup final.
            if let Some(schema) = self.catalog.schema_at(self.read_timestamp) {
                inner.schema = schema;
            }
            inner.fenced = true;
        }

        let resolved = resolve_read(&inner.schema, arg)?;
        let ranges = canonicalize_key_set(&arg.key_set, &resolved.key_types, &resolved.key_orders)?;
        let mut rows = Vec::new();
        for range in &ranges {
            for (_key, row) in self.store.read(
                self.read_timestamp,
                resolved.storage_table,
                range,
                &resolved.positions,
            )? {
                rows.push(row);
            }
        }
        Ok(RowCursor::new(resolved.columns, rows, self.cancel.clone()))
    }
}

impl Drop for ReadOnlyTransaction {
    fn drop(&mut self) {
        self.handle.release();
    }
}

fn pick_read_timestamp(
    bound: TimestampBound,
    clock: &Clock,
    locks: &LockManager,
) -> Timestamp {
    match bound {
        TimestampBound::Strong => clock.now(),
        TimestampBound::ExactTimestamp(ts) => ts,
        TimestampBound::ExactStaleness(staleness) => clock.now().sub(staleness),
        TimestampBound::MinTimestamp(min_ts) => {
            let now = clock.now();
            sample_stale_timestamp(min_ts, now, locks)
        }
        TimestampBound::MaxStaleness(staleness) => {
            let now = clock.now();
            sample_stale_timestamp(now.sub(staleness), now, locks)
        }
    }
}

/// Pick a random timestamp in `[floor, now]`, modeling replica lag. Any
/// timestamp at or before the last commit is guaranteed consistent, so the
/// floor is raised to it. One `now` snapshot is used for both the range and
/// the result, so the sampled staleness can never go negative.
fn sample_stale_timestamp(floor: Timestamp, now: Timestamp, locks: &LockManager) -> Timestamp {
    let floor = floor.max(locks.last_commit_timestamp());
    if floor >= now {
        return floor;
    }
    let staleness = rand::thread_rng().gen_range(0..=(now.0 - floor.0));
    Timestamp(now.0 - staleness)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Arc<Clock>, Arc<LockManager>) {
        let clock = Arc::new(Clock::new());
        let locks = Arc::new(LockManager::new(
            Arc::clone(&clock),
            Duration::from_secs(1),
        ));
        (clock, locks)
    }

    #[test]
    fn test_strong_bound_reads_at_now() {
        let (clock, locks) = fixture();
        let before = clock.now();
        let ts = pick_read_timestamp(TimestampBound::Strong, &clock, &locks);
        let after = clock.now();
        assert!(ts > before && ts < after);
    }

    #[test]
    fn test_exact_bounds() {
        let (clock, locks) = fixture();
        let target = Timestamp(123);
        assert_eq!(
            pick_read_timestamp(TimestampBound::ExactTimestamp(target), &clock, &locks),
            target
        );
        let staleness = Duration::from_secs(10);
        let ts = pick_read_timestamp(TimestampBound::ExactStaleness(staleness), &clock, &locks);
        let now = clock.now();
        assert!(now.since(ts) >= staleness);
    }

    #[test]
    fn test_stale_sample_stays_within_range() {
        let (clock, locks) = fixture();
        for _ in 0..100 {
            let now = clock.now();
            let floor = now.sub(Duration::from_secs(5));
            let ts = sample_stale_timestamp(floor, now, &locks);
            assert!(ts >= floor);
            assert!(ts <= now);
        }
    }

    #[test]
    fn test_stale_sample_floor_raised_to_last_commit() {
        let (clock, locks) = fixture();
        let _h = locks.create_handle(TxnId(1), LockPriority::READ_WRITE);
        let commit_ts = locks.assign_commit_timestamp(TxnId(1)).unwrap();
        locks.mark_safe_read(commit_ts);

        for _ in 0..100 {
            let now = clock.now();
            let ts = sample_stale_timestamp(Timestamp(0), now, &locks);
            assert!(ts >= commit_ts);
        }
    }

    #[test]
    fn test_stale_sample_with_future_floor() {
        let (clock, locks) = fixture();
        let now = clock.now();
        let future = now.add(Duration::from_secs(60));
        assert_eq!(sample_stale_timestamp(future, now, &locks), future);
    }
}
