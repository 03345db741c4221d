//! Per-transaction state
//!
//! A transaction carries everything the coordinator needs to finish it:
//! which sites it touched, which locks it holds, which writes wait for
//! commit, and the operation it is blocked on, if any. Read-only
//! transactions carry a frozen snapshot instead of locks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::data::LockMode;
use crate::types::{SiteId, Tick, TxnId, VariableId};

/// What a blocked transaction will retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Normal,
    ReadBlocked { var: VariableId },
    WriteBlocked { var: VariableId, value: i64 },
}

/// A deferred write: the value and the sites that were running when the
/// write lock was taken. Only those sites receive the value at commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub value: i64,
    pub sites: Vec<SiteId>,
}

#[derive(Debug)]
pub struct Transaction {
    pub id: TxnId,
    pub start_tick: Tick,
    pub read_only: bool,
    pub status: TxnStatus,
    /// Sites this transaction has read from or written to.
    pub touched_sites: BTreeSet<SiteId>,
    /// Strongest lock mode held per variable.
    pub held_locks: BTreeMap<VariableId, LockMode>,
    /// Deferred writes, last write per variable wins.
    pub pending_writes: BTreeMap<VariableId, PendingWrite>,
    /// Frozen view for read-only transactions.
    pub snapshot: BTreeMap<VariableId, i64>,
    /// Set when a touched site fails before the transaction ends.
    pub abort_pending: bool,
}

impl Transaction {
    pub fn new(id: TxnId, start_tick: Tick, read_only: bool) -> Self {
        Transaction {
            id,
            start_tick,
            read_only,
            status: TxnStatus::Normal,
            touched_sites: BTreeSet::new(),
            held_locks: BTreeMap::new(),
            pending_writes: BTreeMap::new(),
            snapshot: BTreeMap::new(),
            abort_pending: false,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.status != TxnStatus::Normal
    }

    /// Record a read lock unless a lock for the variable is already held.
    /// A held write lock is not demoted.
    pub fn record_read_lock(&mut self, var: VariableId) {
        self.held_locks.entry(var).or_insert(LockMode::Read);
    }

    /// Record a write lock, upgrading a recorded read lock.
    pub fn record_write_lock(&mut self, var: VariableId) {
        self.held_locks.insert(var, LockMode::Write);
    }

    /// Record a deferred write. A second write to the same variable replaces
    /// the first.
    pub fn record_pending_write(&mut self, var: VariableId, value: i64, sites: Vec<SiteId>) {
        self.pending_writes.insert(var, PendingWrite { value, sites });
    }

    /// Single-line status rendering used by debug logging.
    pub fn status_line(&self) -> String {
        let mut line = format!(
            "T{}\ttype: {}\t|\tstart @ {}\t|\tstatus: {:?}",
            self.id,
            if self.read_only { "ro" } else { "rw" },
            self.start_tick,
            self.status,
        );
        line.push_str("\t|\ttouched:");
        for site in &self.touched_sites {
            let _ = write!(line, " {}", site);
        }
        line.push_str("\t|\tlocked:");
        for var in self.held_locks.keys() {
            let _ = write!(line, " {}", var);
        }
        line
    }
}
