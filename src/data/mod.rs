//! Site cluster and available-copies routing
//!
//! The [`DataManager`] owns the ten sites and routes every read and write
//! according to the available-copies rule: a read is served by the first
//! running site with a valid copy, a write takes the lock on every running
//! copy. Values only move at commit time; `write` records lock ownership and
//! the sites that will receive the value.

pub mod lock;
pub mod site;
pub mod variable;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, info};

pub use lock::{Lock, LockKind, LockMode};
pub use site::{ReadAdmission, Site, WriteAdmission};
pub use variable::Variable;

use crate::error::Result;
use crate::txn::transaction::{PendingWrite, Transaction};
use crate::types::{SiteId, Tick, TxnId, VariableId, SITE_COUNT};

/// Result of routing a read through the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Served by a live site; the site becomes a touched site.
    Site { site: SiteId, value: i64 },
    /// Served from a read-only transaction's frozen snapshot.
    Snapshot { value: i64 },
    /// Refused by the listed lock holders.
    Blocked(Vec<TxnId>),
    /// No running site currently carries a readable copy.
    SiteWait,
    /// The snapshot is populated but no longer serves this variable; the
    /// read-only transaction must abort.
    SnapshotMiss,
}

/// Result of routing a write through the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Write locks taken on every running copy; these sites receive the
    /// value at commit.
    Granted(Vec<SiteId>),
    /// Refused by the listed lock holders.
    Blocked(Vec<TxnId>),
    /// No site hosting the variable is running.
    SiteWait,
}

/// The cluster of sites plus the variable-to-site routing table.
#[derive(Debug)]
pub struct DataManager {
    sites: BTreeMap<SiteId, Site>,
    var_sites: BTreeMap<VariableId, Vec<SiteId>>,
}

impl Default for DataManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DataManager {
    /// Boot all ten sites and index which sites host which variable, in
    /// ascending site order.
    pub fn new() -> Self {
        let mut sites = BTreeMap::new();
        for id in 1..=SITE_COUNT {
            sites.insert(id, Site::new(id));
        }
        let mut var_sites = BTreeMap::new();
        for var in VariableId::all() {
            let hosts: Vec<SiteId> = (1..=SITE_COUNT).filter(|&s| var.hosted_on(s)).collect();
            var_sites.insert(var, hosts);
        }
        info!("initialized {} sites", SITE_COUNT);
        DataManager { sites, var_sites }
    }

    pub fn site(&self, id: SiteId) -> Option<&Site> {
        self.sites.get(&id)
    }

    /// Sites hosting `var`, ascending.
    pub fn sites_for(&self, var: VariableId) -> &[SiteId] {
        self.var_sites
            .get(&var)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Freeze a consistent view of every readable variable for a read-only
    /// transaction: the current value of each ready variable on each running
    /// site.
    pub fn generate_snapshot(&self, txn: &mut Transaction) -> Result<()> {
        for site in self.sites.values().filter(|s| s.is_running()) {
            for variable in site.variables() {
                let var = variable.id();
                if site.is_ready(var) {
                    txn.snapshot.insert(var, variable.value());
                    debug!("snapshot for T{}: {} = {}", txn.id, var, variable.value());
                }
            }
        }
        info!("snapshot generated for T{}", txn.id);
        Ok(())
    }

    /// Route a read.
    ///
    /// Read-only transactions are served from their snapshot; a populated
    /// snapshot that misses the variable is a fatal miss, an empty snapshot
    /// is rebuilt on the spot. Read-write transactions take a read lock on
    /// the first running site with a valid copy.
    pub fn read(&mut self, txn: &mut Transaction, var: VariableId) -> Result<ReadOutcome> {
        if txn.read_only {
            if !txn.snapshot.is_empty() {
                return match txn.snapshot.get(&var) {
                    Some(&value) => {
                        info!("T{} (ro) read {} = {}", txn.id, var, value);
                        Ok(ReadOutcome::Snapshot { value })
                    }
                    None => {
                        debug!("T{} (ro): {} absent from populated snapshot", txn.id, var);
                        Ok(ReadOutcome::SnapshotMiss)
                    }
                };
            }
            // nothing frozen yet, build the view now
            self.generate_snapshot(txn)?;
            return match txn.snapshot.get(&var) {
                Some(&value) => {
                    info!("T{} (ro) read {} = {}", txn.id, var, value);
                    Ok(ReadOutcome::Snapshot { value })
                }
                None => {
                    txn.snapshot.clear();
                    debug!("T{} (ro): no readable copy of {}, waiting on sites", txn.id, var);
                    Ok(ReadOutcome::SiteWait)
                }
            };
        }

        let hosts = self.sites_for(var).to_vec();
        for site_id in hosts {
            let site = match self.sites.get_mut(&site_id) {
                Some(s) if s.is_running() && s.is_ready(var) => s,
                _ => continue,
            };
            match site.read_admission(var, txn.id)? {
                ReadAdmission::Conflict(holders) => {
                    debug!("T{} blocked reading {} at site {}", txn.id, var, site_id);
                    return Ok(ReadOutcome::Blocked(holders));
                }
                ReadAdmission::Granted => {
                    if site.lock_kind(var)? != LockKind::Write {
                        site.add_lock(var, txn.id, LockMode::Read)?;
                    }
                    let value = site.value(var)?;
                    info!("T{} read {} = {} from site {}", txn.id, var, value, site_id);
                    return Ok(ReadOutcome::Site {
                        site: site_id,
                        value,
                    });
                }
            }
        }
        debug!("T{}: no readable copy of {}", txn.id, var);
        Ok(ReadOutcome::SiteWait)
    }

    /// Route a write.
    ///
    /// Every running copy must admit the write lock. A foreign write lock or
    /// a denied promotion fails at once with those holders; read conflicts
    /// accumulate across sites. On success the write lock is taken on every
    /// running copy and those sites become the commit targets.
    pub fn write(
        &mut self,
        txn: TxnId,
        var: VariableId,
        waiters: &HashMap<TxnId, Vec<TxnId>>,
    ) -> Result<WriteOutcome> {
        let hosts = self.sites_for(var).to_vec();
        let mut targets = Vec::new();
        let mut blocked: BTreeSet<TxnId> = BTreeSet::new();
        let mut admitted = true;

        for &site_id in &hosts {
            let site = match self.sites.get(&site_id) {
                Some(s) if s.is_running() => s,
                _ => continue,
            };
            targets.push(site_id);
            match site.write_admission(var, txn, waiters)? {
                WriteAdmission::Granted => {}
                WriteAdmission::WriteConflict(holders) => {
                    debug!("T{} blocked writing {}: write lock at site {}", txn, var, site_id);
                    return Ok(WriteOutcome::Blocked(holders));
                }
                WriteAdmission::PromotionDenied(waiting) => {
                    debug!("T{}: promotion on {} denied, others wait on it", txn, var);
                    return Ok(WriteOutcome::Blocked(waiting));
                }
                WriteAdmission::ReadConflict(holders) => {
                    admitted = false;
                    blocked.extend(holders);
                }
            }
        }

        if targets.is_empty() {
            debug!("T{}: no running site hosts {}", txn, var);
            return Ok(WriteOutcome::SiteWait);
        }
        if !admitted {
            debug!("T{} blocked writing {} by {:?}", txn, var, blocked);
            return Ok(WriteOutcome::Blocked(blocked.into_iter().collect()));
        }

        for &site_id in &targets {
            if let Some(site) = self.sites.get_mut(&site_id) {
                site.add_lock(var, txn, LockMode::Write)?;
            }
        }
        debug!("T{} write-locked {} on sites {:?}", txn, var, targets);
        Ok(WriteOutcome::Granted(targets))
    }

    /// Install a transaction's deferred writes. Only sites that were
    /// targeted by the write and are still running receive the value; a
    /// landed value makes the copy readable again.
    pub fn commit(&mut self, pending: &BTreeMap<VariableId, PendingWrite>) -> Result<()> {
        for (&var, write) in pending {
            for &site_id in &write.sites {
                if let Some(site) = self.sites.get_mut(&site_id) {
                    if site.is_running() {
                        site.write_value(var, write.value)?;
                        info!("{} = {} written at site {}", var, write.value, site_id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Drop `txn`'s locks on every running copy of each held variable.
    /// Returns the variables whose locks are now free on every running host,
    /// which seeds the retry of their waiters.
    pub fn release_locks(
        &mut self,
        txn: TxnId,
        held: &BTreeMap<VariableId, LockMode>,
    ) -> Result<BTreeSet<VariableId>> {
        let mut freed = BTreeSet::new();
        for &var in held.keys() {
            let hosts = self.sites_for(var).to_vec();
            let mut still_locked = false;
            for site_id in hosts {
                let site = match self.sites.get_mut(&site_id) {
                    Some(s) if s.is_running() => s,
                    _ => continue,
                };
                site.remove_lock(var, txn)?;
                if !site.is_lock_free(var)? {
                    still_locked = true;
                }
            }
            if !still_locked {
                debug!("{} is free", var);
                freed.insert(var);
            }
        }
        Ok(freed)
    }

    /// Fail a site. Returns false when the site was already down.
    pub fn fail(&mut self, site_id: SiteId) -> bool {
        match self.sites.get_mut(&site_id) {
            Some(site) if site.is_running() => {
                site.fail();
                info!("site {} failed", site_id);
                true
            }
            _ => false,
        }
    }

    /// Recover a site. Returns false when the site was already running.
    pub fn recover(&mut self, site_id: SiteId, tick: Tick) -> bool {
        match self.sites.get_mut(&site_id) {
            Some(site) if !site.is_running() => {
                site.recover(tick);
                info!("site {} recovered", site_id);
                true
            }
            _ => false,
        }
    }

    fn site_line(site: &Site) -> String {
        let pairs: Vec<String> = site
            .variables()
            .map(|v| format!("{}: {}", v.id(), v.value()))
            .collect();
        format!("Site {}: {}", site.id(), pairs.join(", "))
    }

    /// One line per running site with every hosted variable and its value.
    pub fn dump_all(&self) -> Vec<String> {
        self.sites
            .values()
            .filter(|s| s.is_running())
            .map(Self::site_line)
            .collect()
    }

    /// Dump a single site, marking a failed site as down.
    pub fn dump_site(&self, site_id: SiteId) -> Vec<String> {
        match self.sites.get(&site_id) {
            Some(site) if site.is_running() => vec![Self::site_line(site)],
            Some(site) => vec![format!("Site {}: down", site.id())],
            None => vec![format!("Site {}: unknown", site_id)],
        }
    }

    /// Dump one variable across its running hosts.
    pub fn dump_variable(&self, var: VariableId) -> Vec<String> {
        let mut lines = Vec::new();
        for &site_id in self.sites_for(var) {
            if let Some(site) = self.sites.get(&site_id) {
                if site.is_running() {
                    if let Ok(value) = site.value(var) {
                        lines.push(format!("Site {}: {}: {}", site_id, var, value));
                    }
                }
            }
        }
        lines
    }
}
