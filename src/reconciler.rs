//! Enforcement reconciler.
//!
//! One cycle converges the live block table towards the authority's
//! effective blacklist:
//!
//! 1. fetch the block set (abort with no mutation on failure)
//! 2. read the live table membership
//! 3. diff, after dropping anything that would cover a protected address
//! 4. re-assert the baseline rules (abort if that fails)
//! 5. apply removals, then additions; a failed member is logged and skipped
//! 6. probe the authority if anything changed
//!
//! Cycles on one reconciler never overlap: a tick that arrives while a cycle
//! is still running is skipped.

use anyhow::Result;
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::authority::Authority;
use crate::enforcer::{BaselineRule, BlockTable, RuleStatus};
use crate::normalizer::parse_token;
use crate::signal::ShutdownToken;

/// Members to add and remove to turn `live` into `desired`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Diff {
    pub to_add: Vec<IpNet>,
    pub to_remove: Vec<IpNet>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

pub fn compute_diff(desired: &BTreeSet<IpNet>, live: &BTreeSet<IpNet>) -> Diff {
    Diff {
        to_add: desired.difference(live).copied().collect(),
        to_remove: live.difference(desired).copied().collect(),
    }
}

/// Drop every network already covered by another one in the set. Interval
/// sets refuse overlapping elements, so a host inside a blocked range must
/// not be added on its own.
pub fn collapse(nets: BTreeSet<IpNet>) -> BTreeSet<IpNet> {
    // Sorted by network address, a covering range precedes what it covers,
    // and kept ranges are disjoint, so only the last kept one can cover.
    let mut kept: Vec<IpNet> = Vec::with_capacity(nets.len());
    for net in nets {
        match kept.last() {
            Some(last) if last.contains(&net) => {}
            _ => kept.push(net),
        }
    }
    kept.into_iter().collect()
}

/// True if blocking `net` would cut off (part of) `protected`.
fn overlaps(net: &IpNet, protected: &IpNet) -> bool {
    net.contains(&protected.network()) || protected.contains(&net.network())
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Must-stay-reachable networks, authority first
    pub protected: Vec<IpNet>,
    pub baseline: Vec<BaselineRule>,
    pub interval: Duration,
}

/// Outcome of one fetch, read and diff, before anything is touched.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub diff: Diff,
    /// Authoritative entries withheld by the self-lockout guard
    pub skipped_protected: Vec<IpNet>,
    /// Entries from the authority that did not parse
    pub malformed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to change
    Converged,
    /// Changes applied and the authority still answers
    Applied,
    /// Some member changes failed; the rest were applied
    Partial,
    FetchFailed,
    ReadFailed,
    /// Baseline rules could not be asserted; nothing else was touched
    GuardFailed,
    /// Changes applied but the authority no longer answers
    AuthorityLost,
    /// Previous cycle still running
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub added: usize,
    pub removed: usize,
    pub rules_added: usize,
    pub skipped_protected: usize,
    pub failures: usize,
}

impl CycleReport {
    fn aborted(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            added: 0,
            removed: 0,
            rules_added: 0,
            skipped_protected: 0,
            failures: 0,
        }
    }

    fn mutated(&self) -> bool {
        self.added + self.removed + self.rules_added > 0
    }
}

pub struct Reconciler {
    config: ReconcilerConfig,
    authority: Arc<dyn Authority>,
    table: Arc<dyn BlockTable>,
    cycle: Mutex<()>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig, authority: Arc<dyn Authority>, table: Arc<dyn BlockTable>) -> Self {
        Self {
            config,
            authority,
            table,
            cycle: Mutex::new(()),
        }
    }

    /// Fetch, read and diff without touching the filter (dry run).
    pub async fn plan(&self) -> Result<Plan> {
        self.prepare().await.map_err(|(_, e)| e)
    }

    async fn prepare(&self) -> Result<Plan, (CycleOutcome, anyhow::Error)> {
        let set = self
            .authority
            .effective_blacklist()
            .await
            .map_err(|e| (CycleOutcome::FetchFailed, e))?;

        let mut desired = BTreeSet::new();
        let mut skipped_protected = Vec::new();
        let mut malformed = 0;
        for ip in &set.ips {
            let net = match parse_token(ip) {
                Ok(net) => net,
                Err(e) => {
                    debug!("Ignoring entry from authority: {}", e);
                    malformed += 1;
                    continue;
                }
            };
            match self.config.protected.iter().find(|p| overlaps(&net, p)) {
                Some(protected) => {
                    warn!(
                        "Self-lockout guard: not blocking {} (covers protected {})",
                        net, protected
                    );
                    skipped_protected.push(net);
                }
                None => {
                    desired.insert(net);
                }
            }
        }
        if malformed > 0 {
            warn!("Authority sent {} unparsable entries", malformed);
        }
        let total = desired.len();
        let desired = collapse(desired);
        if desired.len() < total {
            debug!(
                "{} entries already covered by a blocked range",
                total - desired.len()
            );
        }

        let live = self
            .table
            .list_members()
            .await
            .map_err(|e| (CycleOutcome::ReadFailed, e))?;

        Ok(Plan {
            diff: compute_diff(&desired, &live),
            skipped_protected,
            malformed,
        })
    }

    async fn ensure_baseline(&self) -> Result<usize> {
        let mut added = 0;
        for rule in &self.config.baseline {
            let status = self.table.ensure_rule(rule.priority, &rule.predicate).await?;
            if status == RuleStatus::Added {
                info!("Restored rule {} ({})", rule.priority, rule.predicate);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Run one reconciliation cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let Ok(_running) = self.cycle.try_lock() else {
            warn!("Previous reconciliation cycle still running, skipping tick");
            return CycleReport::aborted(CycleOutcome::Skipped);
        };

        let plan = match self.prepare().await {
            Ok(plan) => plan,
            Err((outcome, e)) => {
                match outcome {
                    CycleOutcome::FetchFailed => {
                        warn!("Cannot fetch block set, leaving filter untouched: {:#}", e)
                    }
                    _ => error!("Cannot read {} block table: {:#}", self.table.name(), e),
                }
                return CycleReport::aborted(outcome);
            }
        };

        let mut report = CycleReport::aborted(CycleOutcome::Converged);
        report.skipped_protected = plan.skipped_protected.len();

        match self.ensure_baseline().await {
            Ok(n) => report.rules_added = n,
            Err(e) => {
                error!("Cannot assert baseline rules, not touching block table: {:#}", e);
                report.outcome = CycleOutcome::GuardFailed;
                return report;
            }
        }

        for net in &plan.diff.to_remove {
            match self.table.remove(net).await {
                Ok(()) => {
                    debug!("Unblocked {}", net);
                    report.removed += 1;
                }
                Err(e) => {
                    warn!("Failed to remove {}: {:#}", net, e);
                    report.failures += 1;
                }
            }
        }
        for net in &plan.diff.to_add {
            match self.table.add(net).await {
                Ok(()) => {
                    debug!("Blocked {}", net);
                    report.added += 1;
                }
                Err(e) => {
                    warn!("Failed to add {}: {:#}", net, e);
                    report.failures += 1;
                }
            }
        }

        if !report.mutated() {
            if report.failures > 0 {
                warn!("No member change could be applied ({} failed)", report.failures);
                report.outcome = CycleOutcome::Partial;
            } else {
                debug!("Block table converged");
            }
            return report;
        }

        report.outcome = match self.authority.probe().await {
            Ok(()) if report.failures > 0 => CycleOutcome::Partial,
            Ok(()) => CycleOutcome::Applied,
            Err(e) => {
                error!(
                    critical = true,
                    added = report.added,
                    removed = report.removed,
                    "Authority unreachable after applying changes: {:#}",
                    e
                );
                CycleOutcome::AuthorityLost
            }
        };
        info!(
            "Cycle applied: +{} -{} ({} rules restored, {} failed, {} withheld)",
            report.added, report.removed, report.rules_added, report.failures, report.skipped_protected
        );
        report
    }

    /// Cycle on every tick until shutdown. A running cycle always finishes
    /// before shutdown is honoured.
    pub async fn run(&self, shutdown: ShutdownToken) {
        info!(
            "Reconciler started on {} backend, every {:?}",
            self.table.name(),
            self.config.interval
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }
        info!("Reconciler stopped");
    }
}
