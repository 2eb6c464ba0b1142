//! Reconciliation properties against an in-memory block table and a
//! scripted authority.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use blocksync::authority::Authority;
use blocksync::config::AgentConfig;
use blocksync::enforcer::{baseline_rules, MemoryTable, RulePredicate, TableOp};
use blocksync::exporter::EffectiveBlockSet;
use blocksync::reconciler::{CycleOutcome, Reconciler, ReconcilerConfig};
use blocksync::signal::ShutdownToken;
use ipnet::IpNet;

/// Replays one response per fetch; `None` is a failed fetch. The last
/// response repeats once the script runs out.
struct ScriptedAuthority {
    script: Mutex<VecDeque<Option<Vec<&'static str>>>>,
    last: Mutex<Option<Vec<&'static str>>>,
    fetches: AtomicUsize,
    probes: AtomicUsize,
}

impl ScriptedAuthority {
    fn new(script: Vec<Option<Vec<&'static str>>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            fetches: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Authority for ScriptedAuthority {
    async fn effective_blacklist(&self) -> Result<EffectiveBlockSet> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        let response = match next {
            Some(response) => {
                *self.last.lock().unwrap() = response.clone();
                response
            }
            None => self.last.lock().unwrap().clone(),
        };
        match response {
            Some(ips) => Ok(EffectiveBlockSet {
                count: ips.len(),
                ips: ips.into_iter().map(String::from).collect(),
                format: "plain".into(),
            }),
            None => anyhow::bail!("authority unreachable"),
        }
    }

    async fn probe(&self) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn net(s: &str) -> IpNet {
    if s.contains('/') {
        s.parse().unwrap()
    } else {
        IpNet::from(s.parse::<std::net::IpAddr>().unwrap())
    }
}

fn set(items: &[&str]) -> BTreeSet<IpNet> {
    items.iter().map(|s| net(s)).collect()
}

fn reconciler(authority: Arc<ScriptedAuthority>, table: Arc<MemoryTable>, protected: &[&str]) -> Reconciler {
    let protected: Vec<IpNet> = protected.iter().map(|p| net(p)).collect();
    let baseline = baseline_rules(&AgentConfig::default(), &protected);
    Reconciler::new(
        ReconcilerConfig {
            protected,
            baseline,
            interval: Duration::from_millis(20),
        },
        authority,
        table,
    )
}

#[tokio::test]
async fn test_convergence_from_overlapping_sets() {
    let authority = ScriptedAuthority::new(vec![Some(vec!["10.0.0.1", "10.0.0.2"])]);
    let table = Arc::new(MemoryTable::with_members(set(&["10.0.0.2", "10.0.0.3"])));
    let r = reconciler(authority, table.clone(), &[]);

    let report = r.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::Applied);
    assert_eq!(table.members(), set(&["10.0.0.1", "10.0.0.2"]));

    // B untouched, C removed before A added
    let ops: Vec<TableOp> = table
        .journal()
        .into_iter()
        .filter(|op| !matches!(op, TableOp::RuleAdded(_)))
        .collect();
    assert_eq!(ops, vec![TableOp::Remove(net("10.0.0.3")), TableOp::Add(net("10.0.0.1"))]);
}

#[tokio::test]
async fn test_baseline_rules_precede_member_changes() {
    let authority = ScriptedAuthority::new(vec![Some(vec!["10.0.0.1"])]);
    let table = Arc::new(MemoryTable::new());
    let r = reconciler(authority, table.clone(), &["192.0.2.1"]);
    r.run_cycle().await;

    let journal = table.journal();
    let first_member = journal
        .iter()
        .position(|op| matches!(op, TableOp::Add(_)))
        .unwrap();
    assert!(journal[..first_member]
        .iter()
        .all(|op| matches!(op, TableOp::RuleAdded(_))));

    let rules = table.rules();
    assert_eq!(rules.get(&600), Some(&RulePredicate::AllowSource(net("192.0.2.1"))));
    assert_eq!(rules.get(&1035), Some(&RulePredicate::DenyTable));
    assert_eq!(rules.get(&65534), Some(&RulePredicate::AllowAll));
}

#[tokio::test]
async fn test_fetch_failure_leaves_table_unchanged() {
    let authority = ScriptedAuthority::new(vec![None]);
    let before = set(&["10.0.0.3", "2001:db8::1"]);
    let table = Arc::new(MemoryTable::with_members(before.clone()));
    let r = reconciler(authority.clone(), table.clone(), &[]);

    let report = r.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::FetchFailed);
    assert_eq!(table.members(), before);
    assert!(table.journal().is_empty());
    assert!(table.rules().is_empty());
    assert_eq!(authority.probes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_recovers_on_next_tick_after_fetch_failure() {
    let authority = ScriptedAuthority::new(vec![None, Some(vec!["10.0.0.1"])]);
    let table = Arc::new(MemoryTable::new());
    let r = reconciler(authority, table.clone(), &[]);

    assert_eq!(r.run_cycle().await.outcome, CycleOutcome::FetchFailed);
    assert_eq!(r.run_cycle().await.outcome, CycleOutcome::Applied);
    assert_eq!(table.members(), set(&["10.0.0.1"]));
}

#[tokio::test]
async fn test_authority_address_never_blocked() {
    let authority = ScriptedAuthority::new(vec![Some(vec!["192.0.2.1", "198.51.100.0/24"])]);
    let table = Arc::new(MemoryTable::new());
    let r = reconciler(authority, table.clone(), &["192.0.2.1"]);

    let report = r.run_cycle().await;
    assert_eq!(report.skipped_protected, 1);
    assert_eq!(table.members(), set(&["198.51.100.0/24"]));
}

#[tokio::test]
async fn test_live_protected_member_is_removed() {
    let authority = ScriptedAuthority::new(vec![Some(vec!["192.0.2.0/24"])]);
    let table = Arc::new(MemoryTable::with_members(set(&["192.0.2.0/24"])));
    let r = reconciler(authority, table.clone(), &["192.0.2.1"]);

    r.run_cycle().await;
    assert!(table.members().is_empty());
}

#[tokio::test]
async fn test_member_failure_does_not_abort_cycle() {
    let authority = ScriptedAuthority::new(vec![Some(vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"])]);
    let table = Arc::new(MemoryTable::new());
    table.fail_member(net("10.0.0.2"));
    let r = reconciler(authority, table.clone(), &[]);

    let report = r.run_cycle().await;
    assert_eq!(report.outcome, CycleOutcome::Partial);
    assert_eq!(report.failures, 1);
    assert_eq!(report.added, 2);
    assert_eq!(table.members(), set(&["10.0.0.1", "10.0.0.3"]));
}

#[tokio::test]
async fn test_read_failure_aborts_cycle() {
    let authority = ScriptedAuthority::new(vec![Some(vec!["10.0.0.1"])]);
    let table = Arc::new(MemoryTable::new());
    table.fail_listing(true);
    let r = reconciler(authority, table.clone(), &[]);

    assert_eq!(r.run_cycle().await.outcome, CycleOutcome::ReadFailed);
    assert!(table.journal().is_empty());
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown() {
    let authority = ScriptedAuthority::new(vec![Some(vec!["10.0.0.1"])]);
    let table = Arc::new(MemoryTable::new());
    let r = reconciler(authority.clone(), table.clone(), &[]);
    let shutdown = ShutdownToken::new();

    let stopper = {
        let shutdown = shutdown.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shutdown.cancel();
        }
    };
    tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(r.run(shutdown), stopper);
    })
    .await
    .unwrap();

    assert!(authority.fetches.load(Ordering::SeqCst) >= 2);
    assert_eq!(table.members(), set(&["10.0.0.1"]));
}
