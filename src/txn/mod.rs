//! The transaction coordinator
//!
//! [`TransactionManager`] drives the logical clock, dispatches script
//! operations, and owns the waiting machinery: the wait-for graph used for
//! deadlock detection, the reverse waiter index consulted by lock
//! promotion, and the per-variable FIFO retry queues. Commit and abort both
//! release locks and wake the waiters of every variable that became free.

pub mod transaction;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use log::{debug, info};

use crate::data::{DataManager, ReadOutcome, WriteOutcome};
use crate::error::{ReplikvError, Result};
use crate::parser::{DumpTarget, Operation};
use crate::types::{SiteId, Tick, TxnId, VariableId};

pub use transaction::{PendingWrite, Transaction, TxnStatus};

/// What a transaction is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WaitTarget {
    /// Another transaction holds a conflicting lock.
    Txn(TxnId),
    /// No site can currently serve the operation.
    SiteAvailability,
}

/// Final outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    Aborted,
}

impl fmt::Display for TxnOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnOutcome::Committed => write!(f, "committed"),
            TxnOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// The coordinator.
pub struct TransactionManager {
    dm: DataManager,
    tick: Tick,
    transactions: HashMap<TxnId, Transaction>,
    /// Wait-for edges, the deadlock detector's input.
    wait_for: HashMap<TxnId, BTreeSet<WaitTarget>>,
    /// Reverse index: every transaction currently waiting on the key.
    /// Consulted by the lock promotion guard.
    waiters_on: HashMap<TxnId, Vec<TxnId>>,
    /// FIFO retry order per variable.
    data_waiters: HashMap<VariableId, Vec<TxnId>>,
    /// Ticks at which each site failed.
    fail_history: HashMap<SiteId, Vec<Tick>>,
    outcomes: BTreeMap<TxnId, TxnOutcome>,
    /// Final committed value of every written variable.
    commit_summary: BTreeMap<VariableId, i64>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        TransactionManager {
            dm: DataManager::new(),
            tick: 0,
            transactions: HashMap::new(),
            wait_for: HashMap::new(),
            waiters_on: HashMap::new(),
            data_waiters: HashMap::new(),
            fail_history: HashMap::new(),
            outcomes: BTreeMap::new(),
            commit_summary: BTreeMap::new(),
        }
    }

    pub fn current_tick(&self) -> Tick {
        self.tick
    }

    pub fn data_manager(&self) -> &DataManager {
        &self.dm
    }

    pub fn is_active(&self, id: TxnId) -> bool {
        self.transactions.contains_key(&id)
    }

    pub fn transaction(&self, id: TxnId) -> Option<&Transaction> {
        self.transactions.get(&id)
    }

    pub fn outcome(&self, id: TxnId) -> Option<TxnOutcome> {
        self.outcomes.get(&id).copied()
    }

    pub fn committed_value(&self, var: VariableId) -> Option<i64> {
        self.commit_summary.get(&var).copied()
    }

    /// Advance the clock by one operation: scan for deadlock, wake
    /// transactions whose block dissolved, then run the operation. Returns
    /// the lines a dump produced, empty for every other operation.
    pub fn step(&mut self, op: &Operation) -> Result<Vec<String>> {
        self.tick += 1;
        self.detect_deadlocks()?;
        self.resurrect_blocked()?;
        self.execute(op)
    }

    fn execute(&mut self, op: &Operation) -> Result<Vec<String>> {
        match *op {
            Operation::Begin { txn } => self.begin(txn, false)?,
            Operation::BeginRo { txn } => self.begin(txn, true)?,
            Operation::Read { txn, var } => self.read(txn, var)?,
            Operation::Write { txn, var, value } => self.write(txn, var, value)?,
            Operation::End { txn } => self.end(txn)?,
            Operation::Fail { site } => self.fail(site)?,
            Operation::Recover { site } => self.recover(site),
            Operation::Dump(ref target) => return Ok(self.dump(target)),
        }
        Ok(Vec::new())
    }

    /// Render a dump without advancing anything.
    pub fn dump(&self, target: &DumpTarget) -> Vec<String> {
        match *target {
            DumpTarget::All => self.dm.dump_all(),
            DumpTarget::Site(site) => self.dm.dump_site(site),
            DumpTarget::Variable(var) => self.dm.dump_variable(var),
        }
    }

    /// Start a transaction. Read-only transactions freeze their snapshot
    /// here, at their start tick.
    pub fn begin(&mut self, id: TxnId, read_only: bool) -> Result<()> {
        if self.transactions.contains_key(&id) || self.outcomes.contains_key(&id) {
            return Err(ReplikvError::Transaction(format!(
                "Transaction T{} already exists",
                id
            )));
        }
        let mut txn = Transaction::new(id, self.tick, read_only);
        if read_only {
            self.dm.generate_snapshot(&mut txn)?;
        }
        info!(
            "T{} begins at tick {}{}",
            id,
            self.tick,
            if read_only { " (read-only)" } else { "" }
        );
        self.transactions.insert(id, txn);
        Ok(())
    }

    /// Execute or retry a read for `id`.
    pub fn read(&mut self, id: TxnId, var: VariableId) -> Result<()> {
        if self.already_finished(id, "read")? {
            return Ok(());
        }
        let txn = self
            .transactions
            .get_mut(&id)
            .ok_or_else(|| ReplikvError::unknown_transaction(id))?;
        match self.dm.read(txn, var)? {
            ReadOutcome::Site { site, .. } => {
                txn.touched_sites.insert(site);
                txn.record_read_lock(var);
                txn.status = TxnStatus::Normal;
                self.clear_waiting(id);
            }
            ReadOutcome::Snapshot { .. } => {
                txn.status = TxnStatus::Normal;
                self.clear_waiting(id);
            }
            ReadOutcome::Blocked(holders) => {
                self.block_on_txns(id, var, TxnStatus::ReadBlocked { var }, holders);
            }
            ReadOutcome::SiteWait => {
                self.block_on_site(id, TxnStatus::ReadBlocked { var });
            }
            ReadOutcome::SnapshotMiss => {
                self.abort(id, "snapshot no longer serves the variable")?;
            }
        }
        Ok(())
    }

    /// Execute or retry a write for `id`. The write defers the value; it
    /// only takes locks and records the running sites as commit targets.
    pub fn write(&mut self, id: TxnId, var: VariableId, value: i64) -> Result<()> {
        if self.already_finished(id, "write")? {
            return Ok(());
        }
        {
            let txn = self
                .transactions
                .get(&id)
                .ok_or_else(|| ReplikvError::unknown_transaction(id))?;
            if txn.read_only {
                return Err(ReplikvError::Transaction(format!(
                    "read-only transaction T{} cannot write",
                    id
                )));
            }
        }
        match self.dm.write(id, var, &self.waiters_on)? {
            WriteOutcome::Granted(sites) => {
                let txn = self
                    .transactions
                    .get_mut(&id)
                    .ok_or_else(|| ReplikvError::unknown_transaction(id))?;
                txn.touched_sites.extend(sites.iter().copied());
                txn.record_pending_write(var, value, sites);
                txn.record_write_lock(var);
                txn.status = TxnStatus::Normal;
                self.clear_waiting(id);
                info!("T{} wrote {} = {}, deferred to commit", id, var, value);
            }
            WriteOutcome::Blocked(holders) => {
                self.block_on_txns(id, var, TxnStatus::WriteBlocked { var, value }, holders);
            }
            WriteOutcome::SiteWait => {
                self.block_on_site(id, TxnStatus::WriteBlocked { var, value });
            }
        }
        Ok(())
    }

    /// End a transaction: abort when a touched site failed during its
    /// lifetime, otherwise commit.
    pub fn end(&mut self, id: TxnId) -> Result<()> {
        if self.already_finished(id, "end")? {
            return Ok(());
        }
        let must_abort = {
            let txn = self
                .transactions
                .get(&id)
                .ok_or_else(|| ReplikvError::unknown_transaction(id))?;
            txn.abort_pending || self.touched_site_failed(txn)
        };
        if must_abort {
            self.abort(id, "a touched site failed before the end")
        } else {
            self.commit(id)
        }
    }

    /// Fail a site: wipe it, stamp the failure tick, and flag every live
    /// transaction that touched it for abort at its end. Failing a site
    /// that is already down is a no-op.
    pub fn fail(&mut self, site: SiteId) -> Result<()> {
        if !self.dm.fail(site) {
            return Ok(());
        }
        self.fail_history.entry(site).or_default().push(self.tick);
        for txn in self.transactions.values_mut() {
            if txn.touched_sites.contains(&site) {
                txn.abort_pending = true;
                debug!("T{} flagged for abort, touched failed site {}", txn.id, site);
            }
        }
        Ok(())
    }

    /// Recover a site. Waiters on site availability are retried at the top
    /// of the next tick. Recovering a running site is a no-op.
    pub fn recover(&mut self, site: SiteId) {
        self.dm.recover(site, self.tick);
    }

    /// Per-transaction outcomes in id order, then the final committed value
    /// of every written variable.
    pub fn final_report(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (id, outcome) in &self.outcomes {
            lines.push(format!("T{} {}", id, outcome));
        }
        for (var, value) in &self.commit_summary {
            lines.push(format!("{}: {}", var, value));
        }
        lines
    }

    // === waiting machinery ===

    /// A read, write or end that names a finished transaction is ignored;
    /// deadlock victims commonly still have script lines after the abort.
    fn already_finished(&self, id: TxnId, what: &str) -> Result<bool> {
        if self.transactions.contains_key(&id) {
            return Ok(false);
        }
        if self.outcomes.contains_key(&id) {
            debug!("ignoring {} for finished transaction T{}", what, id);
            return Ok(true);
        }
        Err(ReplikvError::unknown_transaction(id))
    }

    fn block_on_txns(
        &mut self,
        id: TxnId,
        var: VariableId,
        status: TxnStatus,
        blockers: Vec<TxnId>,
    ) {
        if let Some(txn) = self.transactions.get_mut(&id) {
            txn.status = status;
        }
        let targets = self.wait_for.entry(id).or_default();
        targets.clear();
        for &blocker in &blockers {
            if blocker != id {
                targets.insert(WaitTarget::Txn(blocker));
            }
        }
        for &blocker in &blockers {
            if blocker == id {
                continue;
            }
            let waiting = self.waiters_on.entry(blocker).or_default();
            if !waiting.contains(&id) {
                waiting.push(id);
            }
        }
        let queue = self.data_waiters.entry(var).or_default();
        if !queue.contains(&id) {
            queue.push(id);
        }
        debug!("T{} waits on {:?} for {}", id, blockers, var);
    }

    fn block_on_site(&mut self, id: TxnId, status: TxnStatus) {
        if let Some(txn) = self.transactions.get_mut(&id) {
            txn.status = status;
        }
        let mut targets = BTreeSet::new();
        targets.insert(WaitTarget::SiteAvailability);
        self.wait_for.insert(id, targets);
        debug!("T{} waits on site availability", id);
    }

    /// Forget that `id` is waiting: its wait-for entry, its spots in the
    /// reverse waiter index and its spots in the retry queues.
    fn clear_waiting(&mut self, id: TxnId) {
        self.wait_for.remove(&id);
        for waiting in self.waiters_on.values_mut() {
            waiting.retain(|&t| t != id);
        }
        for queue in self.data_waiters.values_mut() {
            queue.retain(|&t| t != id);
        }
    }

    /// Drop every index entry of a finished transaction. Edges other
    /// transactions hold toward it become stale and are pruned at the next
    /// deadlock scan.
    fn cleanup_indices(&mut self, id: TxnId) {
        self.clear_waiting(id);
        self.waiters_on.remove(&id);
    }

    fn commit(&mut self, id: TxnId) -> Result<()> {
        let txn = self
            .transactions
            .remove(&id)
            .ok_or_else(|| ReplikvError::unknown_transaction(id))?;
        self.dm.commit(&txn.pending_writes)?;
        let freed = self.dm.release_locks(id, &txn.held_locks)?;
        for (&var, write) in &txn.pending_writes {
            self.commit_summary.insert(var, write.value);
        }
        self.outcomes.insert(id, TxnOutcome::Committed);
        info!("T{} committed at tick {}", id, self.tick);
        self.cleanup_indices(id);
        self.retry_waiters(&freed)
    }

    fn abort(&mut self, id: TxnId, reason: &str) -> Result<()> {
        let txn = match self.transactions.remove(&id) {
            Some(txn) => txn,
            None => return Ok(()),
        };
        debug!("{}", txn.status_line());
        let freed = self.dm.release_locks(id, &txn.held_locks)?;
        self.outcomes.insert(id, TxnOutcome::Aborted);
        info!("T{} aborted at tick {}: {}", id, self.tick, reason);
        self.cleanup_indices(id);
        self.retry_waiters(&freed)
    }

    /// Commit-time validation: any failure of a touched site strictly
    /// inside (start, now) forces an abort.
    fn touched_site_failed(&self, txn: &Transaction) -> bool {
        txn.touched_sites.iter().any(|site| {
            self.fail_history
                .get(site)
                .map(|fails| {
                    fails
                        .iter()
                        .any(|&t| t > txn.start_tick && t < self.tick)
                })
                .unwrap_or(false)
        })
    }

    /// Retry the waiters of every newly freed variable in FIFO order. A
    /// retry that blocks again re-enters the queue.
    fn retry_waiters(&mut self, freed: &BTreeSet<VariableId>) -> Result<()> {
        for var in freed {
            let queue = match self.data_waiters.remove(var) {
                Some(queue) => queue,
                None => continue,
            };
            for waiter in queue {
                let status = match self.transactions.get(&waiter) {
                    Some(txn) => txn.status,
                    None => continue,
                };
                debug!("retrying T{} after {} freed", waiter, var);
                match status {
                    TxnStatus::ReadBlocked { var } => {
                        self.clear_waiting(waiter);
                        self.read(waiter, var)?;
                    }
                    TxnStatus::WriteBlocked { var, value } => {
                        self.clear_waiting(waiter);
                        self.write(waiter, var, value)?;
                    }
                    TxnStatus::Normal => {}
                }
            }
        }
        Ok(())
    }

    /// Retry transactions blocked solely on site availability, plus any
    /// whose last blockers disappeared without freeing a variable. Runs at
    /// the top of every tick.
    fn resurrect_blocked(&mut self) -> Result<()> {
        let mut ids: Vec<TxnId> = self
            .wait_for
            .iter()
            .filter(|(_, targets)| {
                targets.is_empty()
                    || (targets.len() == 1 && targets.contains(&WaitTarget::SiteAvailability))
            })
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        for id in ids {
            let status = match self.transactions.get(&id) {
                Some(txn) => txn.status,
                None => continue,
            };
            match status {
                TxnStatus::ReadBlocked { var } => {
                    self.clear_waiting(id);
                    self.read(id, var)?;
                }
                TxnStatus::WriteBlocked { var, value } => {
                    self.clear_waiting(id);
                    self.write(id, var, value)?;
                }
                TxnStatus::Normal => {
                    self.clear_waiting(id);
                }
            }
        }
        Ok(())
    }

    // === deadlock detection ===

    /// Scan the wait-for graph and abort the youngest member of every
    /// cycle until none remains. No cycle survives into the operation that
    /// follows.
    fn detect_deadlocks(&mut self) -> Result<()> {
        loop {
            self.prune_stale_edges();
            let cycle = match self.find_cycle() {
                Some(cycle) => cycle,
                None => return Ok(()),
            };
            let victim = cycle
                .iter()
                .copied()
                .max_by_key(|id| {
                    (
                        self.transactions
                            .get(id)
                            .map(|txn| txn.start_tick)
                            .unwrap_or(0),
                        *id,
                    )
                })
                .ok_or_else(|| ReplikvError::Internal("empty deadlock cycle".into()))?;
            info!(
                "deadlock among {:?} at tick {}, aborting youngest T{}",
                cycle, self.tick, victim
            );
            self.abort(victim, "deadlock victim")?;
        }
    }

    /// Drop edges from or to transactions that already ended.
    fn prune_stale_edges(&mut self) {
        let live: HashSet<TxnId> = self.transactions.keys().copied().collect();
        self.wait_for.retain(|id, _| live.contains(id));
        for targets in self.wait_for.values_mut() {
            targets.retain(|target| match target {
                WaitTarget::Txn(other) => live.contains(other),
                WaitTarget::SiteAvailability => true,
            });
        }
        self.waiters_on.retain(|id, _| live.contains(id));
        for waiting in self.waiters_on.values_mut() {
            waiting.retain(|t| live.contains(t));
        }
    }

    /// Find one cycle in the wait-for graph, ignoring site-availability
    /// edges. Nodes are visited in ascending id order so victim selection
    /// is deterministic.
    fn find_cycle(&self) -> Option<Vec<TxnId>> {
        let mut nodes: Vec<TxnId> = self.wait_for.keys().copied().collect();
        nodes.sort_unstable();
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        for node in nodes {
            if visited.contains(&node) {
                continue;
            }
            if let Some(cycle) = self.dfs_cycle(node, &mut visited, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: TxnId,
        visited: &mut HashSet<TxnId>,
        path: &mut Vec<TxnId>,
    ) -> Option<Vec<TxnId>> {
        if let Some(pos) = path.iter().position(|&n| n == node) {
            return Some(path[pos..].to_vec());
        }
        if visited.contains(&node) {
            return None;
        }
        path.push(node);
        if let Some(targets) = self.wait_for.get(&node) {
            for target in targets {
                if let WaitTarget::Txn(next) = target {
                    if let Some(cycle) = self.dfs_cycle(*next, visited, path) {
                        return Some(cycle);
                    }
                }
            }
        }
        path.pop();
        visited.insert(node);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(i: u8) -> VariableId {
        VariableId::new(i).unwrap()
    }

    fn op_begin(id: TxnId) -> Operation {
        Operation::Begin { txn: id }
    }

    #[test]
    fn test_begin_twice_is_an_error() {
        let mut tm = TransactionManager::new();
        tm.step(&op_begin(1)).unwrap();
        assert!(tm.step(&op_begin(1)).is_err());
    }

    #[test]
    fn test_write_then_commit_updates_summary() {
        let mut tm = TransactionManager::new();
        tm.step(&op_begin(1)).unwrap();
        tm.step(&Operation::Write {
            txn: 1,
            var: var(1),
            value: 101,
        })
        .unwrap();
        // value is deferred until the end
        assert_eq!(
            tm.data_manager().site(2).unwrap().value(var(1)).unwrap(),
            10
        );
        tm.step(&Operation::End { txn: 1 }).unwrap();
        assert_eq!(tm.outcome(1), Some(TxnOutcome::Committed));
        assert_eq!(tm.committed_value(var(1)), Some(101));
        assert_eq!(
            tm.data_manager().site(2).unwrap().value(var(1)).unwrap(),
            101
        );
    }

    #[test]
    fn test_deadlock_aborts_youngest() {
        let mut tm = TransactionManager::new();
        tm.step(&op_begin(1)).unwrap();
        tm.step(&op_begin(2)).unwrap();
        tm.step(&Operation::Write { txn: 1, var: var(1), value: 11 }).unwrap();
        tm.step(&Operation::Write { txn: 2, var: var(2), value: 22 }).unwrap();
        tm.step(&Operation::Write { txn: 1, var: var(2), value: 12 }).unwrap();
        tm.step(&Operation::Write { txn: 2, var: var(1), value: 21 }).unwrap();
        // the cycle is resolved by the scan at the top of the next tick
        tm.step(&Operation::End { txn: 1 }).unwrap();
        assert_eq!(tm.outcome(2), Some(TxnOutcome::Aborted));
        assert_eq!(tm.outcome(1), Some(TxnOutcome::Committed));
        // T1's blocked write of x2 was retried after the victim released
        assert_eq!(tm.committed_value(var(2)), Some(12));
    }

    #[test]
    fn test_waiters_retry_in_fifo_order() {
        let mut tm = TransactionManager::new();
        tm.step(&op_begin(1)).unwrap();
        tm.step(&op_begin(2)).unwrap();
        tm.step(&op_begin(3)).unwrap();
        tm.step(&Operation::Write { txn: 1, var: var(2), value: 100 }).unwrap();
        tm.step(&Operation::Write { txn: 2, var: var(2), value: 200 }).unwrap();
        tm.step(&Operation::Write { txn: 3, var: var(2), value: 300 }).unwrap();
        tm.step(&Operation::End { txn: 1 }).unwrap();
        // T2 was first in the queue, so it holds the write lock now
        tm.step(&Operation::End { txn: 2 }).unwrap();
        tm.step(&Operation::End { txn: 3 }).unwrap();
        assert_eq!(tm.outcome(2), Some(TxnOutcome::Committed));
        assert_eq!(tm.outcome(3), Some(TxnOutcome::Committed));
        // the last committer's value survives
        assert_eq!(tm.committed_value(var(2)), Some(300));
    }

    #[test]
    fn test_end_of_deadlock_victim_is_ignored() {
        let mut tm = TransactionManager::new();
        tm.step(&op_begin(1)).unwrap();
        tm.step(&op_begin(2)).unwrap();
        tm.step(&Operation::Write { txn: 1, var: var(1), value: 11 }).unwrap();
        tm.step(&Operation::Write { txn: 2, var: var(2), value: 22 }).unwrap();
        tm.step(&Operation::Write { txn: 1, var: var(2), value: 12 }).unwrap();
        tm.step(&Operation::Write { txn: 2, var: var(1), value: 21 }).unwrap();
        tm.step(&Operation::End { txn: 1 }).unwrap();
        // the victim's own end arrives later in the script
        assert!(tm.step(&Operation::End { txn: 2 }).is_ok());
        assert_eq!(tm.outcome(2), Some(TxnOutcome::Aborted));
    }

    #[test]
    fn test_read_blocked_on_site_wakes_after_recover() {
        let mut tm = TransactionManager::new();
        tm.step(&Operation::Fail { site: 4 }).unwrap();
        tm.step(&op_begin(1)).unwrap();
        // x3 lives only on site 4
        tm.step(&Operation::Read { txn: 1, var: var(3) }).unwrap();
        assert!(tm.is_active(1));
        tm.step(&Operation::Recover { site: 4 }).unwrap();
        // the resurrect pass at the top of the next tick retries the read
        tm.step(&Operation::End { txn: 1 }).unwrap();
        assert_eq!(tm.outcome(1), Some(TxnOutcome::Committed));
    }

    #[test]
    fn test_unknown_transaction_is_an_error() {
        let mut tm = TransactionManager::new();
        assert!(tm.step(&Operation::Read { txn: 9, var: var(1) }).is_err());
    }
}
