//! A single site: its variables, lock table and readiness flags
//!
//! A site hosts every even variable plus the odd variables whose home it is.
//! Failure wipes the lock table and marks every hosted variable unreadable.
//! Recovery restores the lock table; replicated variables stay unreadable
//! until a committed write lands on them again, which is the heart of the
//! available-copies rule.

use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::data::lock::{Lock, LockKind, LockMode};
use crate::data::variable::Variable;
use crate::error::{ReplikvError, Result};
use crate::types::{SiteId, Tick, TxnId, VariableId};

/// Outcome of asking a site whether a read lock could be granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadAdmission {
    /// Read may proceed. The caller records the read lock unless the
    /// transaction already holds the write lock here.
    Granted,
    /// Refused by the write holder.
    Conflict(Vec<TxnId>),
}

/// Outcome of asking a site whether a write lock could be granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteAdmission {
    /// Write lock may be taken here.
    Granted,
    /// An incompatible write lock is held; the whole write fails at once.
    WriteConflict(Vec<TxnId>),
    /// Other transactions hold read locks; their ids are accumulated by the
    /// caller across sites.
    ReadConflict(Vec<TxnId>),
    /// The transaction is the sole read holder but other transactions are
    /// waiting on it, so promoting the lock would manufacture a deadlock.
    PromotionDenied(Vec<TxnId>),
}

/// One site in the cluster.
#[derive(Debug)]
pub struct Site {
    id: SiteId,
    running: bool,
    recovered: bool,
    recovered_at: Tick,
    variables: BTreeMap<VariableId, Variable>,
    lock_table: BTreeMap<VariableId, Lock>,
    ready: BTreeMap<VariableId, bool>,
}

impl Site {
    /// Build site `id` with every variable it hosts, a fresh lock table and
    /// all hosted variables readable.
    pub fn new(id: SiteId) -> Self {
        let mut variables = BTreeMap::new();
        let mut lock_table = BTreeMap::new();
        let mut ready = BTreeMap::new();
        for var in VariableId::all().filter(|v| v.hosted_on(id)) {
            variables.insert(var, Variable::new(var));
            lock_table.insert(var, Lock::new());
            ready.insert(var, true);
        }
        Site {
            id,
            running: true,
            recovered: true,
            recovered_at: 0,
            variables,
            lock_table,
            ready,
        }
    }

    pub fn id(&self) -> SiteId {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    /// Tick of the most recent recovery, zero for the initial boot.
    pub fn recovered_at(&self) -> Tick {
        self.recovered_at
    }

    pub fn hosts(&self, var: VariableId) -> bool {
        self.variables.contains_key(&var)
    }

    /// Hosted variables in ascending order.
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    /// A variable is readable only while its ready flag holds.
    pub fn is_ready(&self, var: VariableId) -> bool {
        self.ready.get(&var).copied().unwrap_or(false)
    }

    pub fn value(&self, var: VariableId) -> Result<i64> {
        self.variables
            .get(&var)
            .map(Variable::value)
            .ok_or_else(|| {
                ReplikvError::Internal(format!("site {} does not host {}", self.id, var))
            })
    }

    fn lock(&self, var: VariableId) -> Result<&Lock> {
        self.lock_table.get(&var).ok_or_else(|| {
            ReplikvError::Lock(format!("no lock entry for {} at site {}", var, self.id))
        })
    }

    fn lock_mut(&mut self, var: VariableId) -> Result<&mut Lock> {
        let id = self.id;
        self.lock_table.get_mut(&var).ok_or_else(|| {
            ReplikvError::Lock(format!("no lock entry for {} at site {}", var, id))
        })
    }

    pub fn lock_kind(&self, var: VariableId) -> Result<LockKind> {
        Ok(self.lock(var)?.kind())
    }

    pub fn lock_holders(&self, var: VariableId) -> Result<&[TxnId]> {
        Ok(self.lock(var)?.holders())
    }

    /// Whether the lock on `var` is currently free.
    pub fn is_lock_free(&self, var: VariableId) -> Result<bool> {
        Ok(self.lock(var)?.is_free())
    }

    /// Can `txn` read `var` here right now?
    ///
    /// A foreign write lock refuses with its holder. Anything else admits
    /// the read.
    pub fn read_admission(&self, var: VariableId, txn: TxnId) -> Result<ReadAdmission> {
        let lock = self.lock(var)?;
        match lock.kind() {
            LockKind::Write if !lock.holders().contains(&txn) => {
                Ok(ReadAdmission::Conflict(lock.holders().to_vec()))
            }
            _ => Ok(ReadAdmission::Granted),
        }
    }

    /// Can `txn` take the write lock on `var` here right now?
    ///
    /// `waiters` maps a transaction to the transactions waiting on it; a
    /// sole read holder may promote to write only when nobody waits on it.
    pub fn write_admission(
        &self,
        var: VariableId,
        txn: TxnId,
        waiters: &HashMap<TxnId, Vec<TxnId>>,
    ) -> Result<WriteAdmission> {
        let lock = self.lock(var)?;
        match lock.kind() {
            LockKind::Free => Ok(WriteAdmission::Granted),
            LockKind::Write => {
                if lock.holders().contains(&txn) {
                    Ok(WriteAdmission::Granted)
                } else {
                    Ok(WriteAdmission::WriteConflict(lock.holders().to_vec()))
                }
            }
            LockKind::Read => {
                if lock.held_solely_by(txn) {
                    match waiters.get(&txn) {
                        Some(waiting) if !waiting.is_empty() => {
                            Ok(WriteAdmission::PromotionDenied(waiting.clone()))
                        }
                        _ => Ok(WriteAdmission::Granted),
                    }
                } else {
                    let others = lock
                        .holders()
                        .iter()
                        .copied()
                        .filter(|&t| t != txn)
                        .collect();
                    Ok(WriteAdmission::ReadConflict(others))
                }
            }
        }
    }

    pub fn add_lock(&mut self, var: VariableId, txn: TxnId, mode: LockMode) -> Result<()> {
        debug!("site {}: T{} takes {} lock on {}", self.id, txn, mode, var);
        self.lock_mut(var)?.add(txn, mode);
        Ok(())
    }

    pub fn remove_lock(&mut self, var: VariableId, txn: TxnId) -> Result<()> {
        debug!("site {}: T{} releases lock on {}", self.id, txn, var);
        self.lock_mut(var)?.remove(txn);
        Ok(())
    }

    /// Commit-time value installation. Makes the variable readable again.
    pub fn write_value(&mut self, var: VariableId, value: i64) -> Result<()> {
        let variable = self.variables.get_mut(&var).ok_or_else(|| {
            ReplikvError::Internal(format!("site {} does not host {}", self.id, var))
        })?;
        variable.set_value(value);
        self.ready.insert(var, true);
        debug!("site {}: {} = {}", self.id, var, value);
        Ok(())
    }

    /// Drop the site: locks are wiped and every hosted variable becomes
    /// unreadable until recovery plus a committed write.
    pub fn fail(&mut self) {
        debug!("site {}: failing", self.id);
        self.running = false;
        self.recovered = false;
        self.lock_table.clear();
        for ready in self.ready.values_mut() {
            *ready = false;
        }
    }

    /// Bring the site back with a fresh lock table. Non-replicated variables
    /// are immediately readable; replicated copies stay stale until written.
    pub fn recover(&mut self, tick: Tick) {
        debug!("site {}: recovering at tick {}", self.id, tick);
        self.running = true;
        self.recovered = true;
        self.recovered_at = tick;
        for var in self.variables.keys() {
            self.lock_table.insert(*var, Lock::new());
        }
        for (var, ready) in self.ready.iter_mut() {
            *ready = !var.is_replicated();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(i: u8) -> VariableId {
        VariableId::new(i).unwrap()
    }

    #[test]
    fn test_site_hosts_even_and_home_odd_variables() {
        let site = Site::new(2);
        // all ten even variables plus x1 and x11
        assert!(site.hosts(var(2)));
        assert!(site.hosts(var(20)));
        assert!(site.hosts(var(1)));
        assert!(site.hosts(var(11)));
        assert!(!site.hosts(var(3)));
        assert_eq!(site.variables().count(), 12);

        // odd homes land on even-numbered sites only, so site 1 hosts
        // exactly the ten replicated variables
        let site1 = Site::new(1);
        assert_eq!(site1.variables().count(), 10);
        assert!(site1.hosts(var(10)));
        assert!(!site1.hosts(var(9)));
    }

    #[test]
    fn test_fresh_site_is_ready_and_unlocked() {
        let site = Site::new(3);
        assert!(site.is_running());
        assert!(site.is_ready(var(2)));
        assert_eq!(site.lock_kind(var(2)).unwrap(), LockKind::Free);
        assert_eq!(site.value(var(2)).unwrap(), 20);
    }

    #[test]
    fn test_read_admission_against_write_holder() {
        let mut site = Site::new(1);
        site.add_lock(var(2), 1, LockMode::Write).unwrap();

        assert_eq!(
            site.read_admission(var(2), 1).unwrap(),
            ReadAdmission::Granted
        );
        assert_eq!(
            site.read_admission(var(2), 2).unwrap(),
            ReadAdmission::Conflict(vec![1])
        );
    }

    #[test]
    fn test_write_admission_paths() {
        let mut site = Site::new(1);
        let no_waiters = HashMap::new();

        // free lock admits
        assert_eq!(
            site.write_admission(var(2), 1, &no_waiters).unwrap(),
            WriteAdmission::Granted
        );

        // foreign write lock refuses outright
        site.add_lock(var(2), 1, LockMode::Write).unwrap();
        assert_eq!(
            site.write_admission(var(2), 2, &no_waiters).unwrap(),
            WriteAdmission::WriteConflict(vec![1])
        );
        // own write lock re-admits
        assert_eq!(
            site.write_admission(var(2), 1, &no_waiters).unwrap(),
            WriteAdmission::Granted
        );

        // shared readers refuse with the other holders
        site.add_lock(var(4), 1, LockMode::Read).unwrap();
        site.add_lock(var(4), 2, LockMode::Read).unwrap();
        assert_eq!(
            site.write_admission(var(4), 1, &no_waiters).unwrap(),
            WriteAdmission::ReadConflict(vec![2])
        );
    }

    #[test]
    fn test_promotion_guard() {
        let mut site = Site::new(1);
        site.add_lock(var(2), 1, LockMode::Read).unwrap();

        // sole reader with nobody waiting may promote
        let no_waiters = HashMap::new();
        assert_eq!(
            site.write_admission(var(2), 1, &no_waiters).unwrap(),
            WriteAdmission::Granted
        );

        // a waiter on the promoter blocks the promotion
        let mut waiters = HashMap::new();
        waiters.insert(1, vec![7]);
        assert_eq!(
            site.write_admission(var(2), 1, &waiters).unwrap(),
            WriteAdmission::PromotionDenied(vec![7])
        );
    }

    #[test]
    fn test_fail_clears_locks_and_readiness() {
        let mut site = Site::new(2);
        site.add_lock(var(2), 1, LockMode::Write).unwrap();
        site.fail();

        assert!(!site.is_running());
        assert!(!site.is_recovered());
        assert!(!site.is_ready(var(2)));
        assert!(!site.is_ready(var(1)));
        // lock table was wiped, lookups now surface the misuse
        assert!(site.lock_kind(var(2)).is_err());
    }

    #[test]
    fn test_recover_readiness_split() {
        let mut site = Site::new(2);
        site.fail();
        site.recover(9);

        assert!(site.is_running());
        assert_eq!(site.recovered_at(), 9);
        // odd variables are immediately readable again
        assert!(site.is_ready(var(1)));
        assert!(site.is_ready(var(11)));
        // replicated copies wait for a committed write
        assert!(!site.is_ready(var(2)));
        assert_eq!(site.lock_kind(var(2)).unwrap(), LockKind::Free);

        site.write_value(var(2), 99).unwrap();
        assert!(site.is_ready(var(2)));
        assert_eq!(site.value(var(2)).unwrap(), 99);
    }
}
