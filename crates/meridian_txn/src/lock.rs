//! Per-key lock management and the commit-timestamp registry.
//!
//! Locks are readers-writer per `(table, encoded key)`. Conflicts resolve by
//! wound-wait: a requester that outranks every conflicting holder (lower
//! priority number, then lower transaction id) wounds them; a wounded
//! transaction fails its next lock-manager interaction with `Aborted` and
//! must retry from scratch. Everyone else blocks, bounded by the configured
//! wait timeout.
//!
//! The commit registry makes snapshot reads safe: a commit timestamp is
//! assigned strictly above `max(last commit, clock now)`, registered as
//! pending, and marked safe once its writes are installed. A reader at `ts`
//! waits until no pending commit `<= ts` remains, so a snapshot can never
//! observe a half-applied commit.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meridian_common::clock::Clock;
use meridian_common::error::{Error, Result};
use meridian_common::types::{TableId, Timestamp, TxnId};

/// A lockable resource: one row of one storage table.
pub type LockKey = (TableId, Vec<u8>);

/// Lock priority; lower numbers win conflicts. Read-write transactions
/// outrank snapshot readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockPriority(pub u32);

impl LockPriority {
    pub const READ_WRITE: LockPriority = LockPriority(0);
    pub const READ_ONLY: LockPriority = LockPriority(1);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct LockEntry {
    shared: HashSet<TxnId>,
    exclusive: Option<TxnId>,
}

#[derive(Debug)]
struct HandleInfo {
    priority: LockPriority,
    wounded: bool,
    held: HashMap<LockKey, LockMode>,
}

#[derive(Debug, Default)]
struct LockState {
    locks: HashMap<LockKey, LockEntry>,
    handles: HashMap<TxnId, HandleInfo>,
    /// Commits with an assigned timestamp that have not finished applying.
    pending_commits: BTreeMap<Timestamp, TxnId>,
    /// Largest commit timestamp whose writes are fully installed.
    last_commit: Timestamp,
    /// Largest timestamp handed out so far.
    last_assigned: Timestamp,
}

/// Process-wide lock manager. One per engine instance.
#[derive(Debug)]
pub struct LockManager {
    state: Mutex<LockState>,
    cond: Condvar,
    wait_timeout: Duration,
    clock: Arc<Clock>,
}

impl LockManager {
    pub fn new(clock: Arc<Clock>, wait_timeout: Duration) -> Self {
        LockManager {
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
            wait_timeout,
            clock,
        }
    }

    /// Register a transaction and return its handle. The handle owns every
    /// lock the transaction acquires; dropping it releases them.
    pub fn create_handle(self: &Arc<Self>, txn_id: TxnId, priority: LockPriority) -> LockHandle {
        let mut state = self.state.lock();
        state.handles.insert(
            txn_id,
            HandleInfo {
                priority,
                wounded: false,
                held: HashMap::new(),
            },
        );
        LockHandle {
            mgr: Arc::clone(self),
            txn_id,
        }
    }

    fn acquire(&self, txn_id: TxnId, keys: &[LockKey], mode: LockMode) -> Result<()> {
        let mut keys: Vec<LockKey> = keys.to_vec();
        keys.sort();
        keys.dedup();

        let deadline = Instant::now() + self.wait_timeout;
        let mut state = self.state.lock();
        for key in keys {
            loop {
                let st = &mut *state;
                let info = st
                    .handles
                    .get(&txn_id)
                    .ok_or_else(|| Error::aborted("transaction has released its locks"))?;
                if info.wounded {
                    return Err(Error::aborted(
                        "transaction wounded by a higher priority transaction",
                    ));
                }
                let my_rank = (info.priority, txn_id);

                let entry = st.locks.entry(key.clone()).or_default();
                let grantable = match mode {
                    LockMode::Shared => entry.exclusive.map_or(true, |e| e == txn_id),
                    LockMode::Exclusive => {
                        entry.exclusive.map_or(true, |e| e == txn_id)
                            && entry.shared.iter().all(|&s| s == txn_id)
                    }
                };
                if grantable {
                    match mode {
                        LockMode::Shared => {
                            if entry.exclusive != Some(txn_id) {
                                entry.shared.insert(txn_id);
                            }
                        }
                        LockMode::Exclusive => {
                            entry.shared.remove(&txn_id);
                            entry.exclusive = Some(txn_id);
                        }
                    }
                    let held_mode = match mode {
                        LockMode::Exclusive => LockMode::Exclusive,
                        LockMode::Shared => {
                            if entry.exclusive == Some(txn_id) {
                                LockMode::Exclusive
                            } else {
                                LockMode::Shared
                            }
                        }
                    };
                    if let Some(info) = st.handles.get_mut(&txn_id) {
                        info.held.insert(key.clone(), held_mode);
                    }
                    break;
                }

                // Conflict. Wound every holder we outrank; otherwise wait.
                let mut holders: Vec<TxnId> = Vec::new();
                if let Some(e) = entry.exclusive.filter(|&e| e != txn_id) {
                    holders.push(e);
                }
                if mode == LockMode::Exclusive {
                    holders.extend(entry.shared.iter().copied().filter(|&s| s != txn_id));
                }
                let outranks_all = holders.iter().all(|h| {
                    st.handles
                        .get(h)
                        .map_or(true, |hi| my_rank < (hi.priority, *h))
                });
                if outranks_all {
                    for h in &holders {
                        if let Some(hi) = st.handles.get_mut(h) {
                            if !hi.wounded {
                                hi.wounded = true;
                                tracing::warn!(victim = %h, winner = %txn_id, "wound-wait: aborting lock holder");
                            }
                        }
                    }
                    self.cond.notify_all();
                }

                if self.cond.wait_until(&mut state, deadline).timed_out() {
                    return Err(Error::aborted(format!(
                        "lock wait timed out after {:?}",
                        self.wait_timeout
                    )));
                }
            }
        }
        Ok(())
    }

    /// Release everything a transaction holds. Idempotent; also retracts any
    /// pending commit registration left behind by an abort.
    pub fn release(&self, txn_id: TxnId) {
        let mut state = self.state.lock();
        let st = &mut *state;
        if let Some(info) = st.handles.remove(&txn_id) {
            for (key, _) in info.held {
                let now_free = match st.locks.get_mut(&key) {
                    Some(entry) => {
                        entry.shared.remove(&txn_id);
                        if entry.exclusive == Some(txn_id) {
                            entry.exclusive = None;
                        }
                        entry.shared.is_empty() && entry.exclusive.is_none()
                    }
                    None => false,
                };
                if now_free {
                    st.locks.remove(&key);
                }
            }
            st.pending_commits.retain(|_, owner| *owner != txn_id);
            drop(state);
            self.cond.notify_all();
        }
    }

    /// Assign a commit timestamp strictly greater than both the clock and
    /// every previously assigned timestamp, and register it as pending.
    pub fn assign_commit_timestamp(&self, txn_id: TxnId) -> Result<Timestamp> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let info = state
            .handles
            .get(&txn_id)
            .ok_or_else(|| Error::aborted("transaction has released its locks"))?;
        if info.wounded {
            return Err(Error::aborted(
                "transaction wounded by a higher priority transaction",
            ));
        }
        let floor = state.last_assigned.max(state.last_commit).max(now);
        let ts = floor.next();
        state.last_assigned = ts;
        state.pending_commits.insert(ts, txn_id);
        Ok(ts)
    }

    /// Mark an assigned commit timestamp as fully applied and safe to read.
    pub fn mark_safe_read(&self, ts: Timestamp) {
        let mut state = self.state.lock();
        state.pending_commits.remove(&ts);
        if ts > state.last_commit {
            state.last_commit = ts;
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Withdraw a pending commit that failed before applying.
    pub fn retract_commit(&self, ts: Timestamp) {
        let mut state = self.state.lock();
        state.pending_commits.remove(&ts);
        drop(state);
        self.cond.notify_all();
    }

    /// Block until every commit with an assigned timestamp `<= ts` has
    /// finished (applied or retracted).
    pub fn wait_for_safe_read(&self, ts: Timestamp) -> Result<()> {
        let deadline = Instant::now() + self.wait_timeout;
        let mut state = self.state.lock();
        while state.pending_commits.range(..=ts).next().is_some() {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return Err(Error::deadline_exceeded(format!(
                    "timed out waiting for commits at or before {}",
                    ts
                )));
            }
        }
        Ok(())
    }

    /// Largest commit timestamp whose writes are fully installed.
    pub fn last_commit_timestamp(&self) -> Timestamp {
        self.state.lock().last_commit
    }
}

/// A transaction's handle on the lock manager. Dropping it releases all of
/// the transaction's locks.
#[derive(Debug)]
pub struct LockHandle {
    mgr: Arc<LockManager>,
    txn_id: TxnId,
}

impl LockHandle {
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn acquire_shared(&self, keys: &[LockKey]) -> Result<()> {
        self.mgr.acquire(self.txn_id, keys, LockMode::Shared)
    }

    pub fn acquire_exclusive(&self, keys: &[LockKey]) -> Result<()> {
        self.mgr.acquire(self.txn_id, keys, LockMode::Exclusive)
    }

    pub fn wait_for_safe_read(&self, ts: Timestamp) -> Result<()> {
        self.mgr.wait_for_safe_read(ts)
    }

    pub fn release(&self) {
        self.mgr.release(self.txn_id);
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.mgr.release(self.txn_id);
    }
}
