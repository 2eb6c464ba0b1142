//! In-process block table.
//!
//! Records every mutation in order and can be told to fail specific
//! operations. Backs the reconciler tests.

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{BlockTable, RulePredicate, RuleStatus};

/// A mutation applied to a [`MemoryTable`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOp {
    Add(IpNet),
    Remove(IpNet),
    RuleAdded(u32),
}

#[derive(Default)]
pub struct MemoryTable {
    members: Mutex<BTreeSet<IpNet>>,
    rules: Mutex<BTreeMap<u32, RulePredicate>>,
    journal: Mutex<Vec<TableOp>>,
    fail_list: AtomicBool,
    fail_rules: AtomicBool,
    fail_members: Mutex<HashSet<IpNet>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members<I: IntoIterator<Item = IpNet>>(members: I) -> Self {
        let table = Self::default();
        lock(&table.members).extend(members);
        table
    }

    pub fn members(&self) -> BTreeSet<IpNet> {
        lock(&self.members).clone()
    }

    pub fn rules(&self) -> BTreeMap<u32, RulePredicate> {
        lock(&self.rules).clone()
    }

    pub fn journal(&self) -> Vec<TableOp> {
        lock(&self.journal).clone()
    }

    /// Simulate an external reset of the filter rules
    pub fn clear_rules(&self) {
        lock(&self.rules).clear();
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn fail_rules(&self, fail: bool) {
        self.fail_rules.store(fail, Ordering::SeqCst);
    }

    /// Make add/remove of this member fail
    pub fn fail_member(&self, member: IpNet) {
        lock(&self.fail_members).insert(member);
    }

    fn check_member(&self, member: &IpNet) -> Result<()> {
        if lock(&self.fail_members).contains(member) {
            anyhow::bail!("injected failure for {}", member);
        }
        Ok(())
    }
}

#[async_trait]
impl BlockTable for MemoryTable {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list_members(&self) -> Result<BTreeSet<IpNet>> {
        if self.fail_list.load(Ordering::SeqCst) {
            anyhow::bail!("injected listing failure");
        }
        Ok(self.members())
    }

    async fn add(&self, member: &IpNet) -> Result<()> {
        self.check_member(member)?;
        lock(&self.members).insert(*member);
        lock(&self.journal).push(TableOp::Add(*member));
        Ok(())
    }

    async fn remove(&self, member: &IpNet) -> Result<()> {
        self.check_member(member)?;
        lock(&self.members).remove(member);
        lock(&self.journal).push(TableOp::Remove(*member));
        Ok(())
    }

    async fn ensure_rule(&self, priority: u32, predicate: &RulePredicate) -> Result<RuleStatus> {
        if self.fail_rules.load(Ordering::SeqCst) {
            anyhow::bail!("injected rule failure at {}", priority);
        }
        let mut rules = lock(&self.rules);
        if rules.contains_key(&priority) {
            return Ok(RuleStatus::Present);
        }
        rules.insert(priority, predicate.clone());
        lock(&self.journal).push(TableOp::RuleAdded(priority));
        Ok(RuleStatus::Added)
    }
}
