//! Per-variable lock state
//!
//! Each hosted variable carries one [`Lock`]. A read lock may be shared by
//! several transactions; a write lock has exactly one holder. The lock is
//! free exactly when the holder list is empty.

use crate::types::TxnId;
use std::fmt;

/// Lock mode a transaction requests or holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => write!(f, "read"),
            LockMode::Write => write!(f, "write"),
        }
    }
}

/// Lock table state for one variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Free,
    Read,
    Write,
}

/// Lock on a single variable: current kind plus the holders in acquisition
/// order.
#[derive(Debug, Clone, Default)]
pub struct Lock {
    kind: Option<LockMode>,
    holders: Vec<TxnId>,
}

impl Lock {
    pub fn new() -> Self {
        Lock::default()
    }

    /// Add a holder and set the lock kind.
    ///
    /// Re-adding an existing holder only updates the kind; the holder list
    /// stays duplicate-free. A write add is legal only when the holder list
    /// is empty or already `{txn}`; admission checks at the site enforce
    /// that before calling.
    pub fn add(&mut self, txn: TxnId, mode: LockMode) {
        if !self.holders.contains(&txn) {
            self.holders.push(txn);
        }
        self.kind = Some(mode);
    }

    /// Remove a holder. The lock becomes free when the last holder leaves.
    pub fn remove(&mut self, txn: TxnId) {
        self.holders.retain(|&t| t != txn);
        if self.holders.is_empty() {
            self.kind = None;
        }
    }

    pub fn is_free(&self) -> bool {
        self.kind.is_none()
    }

    pub fn kind(&self) -> LockKind {
        match self.kind {
            None => LockKind::Free,
            Some(LockMode::Read) => LockKind::Read,
            Some(LockMode::Write) => LockKind::Write,
        }
    }

    /// Holders in acquisition order.
    pub fn holders(&self) -> &[TxnId] {
        &self.holders
    }

    /// True when `txn` is the only holder.
    pub fn held_solely_by(&self, txn: TxnId) -> bool {
        self.holders == [txn]
    }
}
