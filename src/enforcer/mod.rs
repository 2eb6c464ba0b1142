//! Enforcement-point packet filter access (ipfw, nftables).
//!
//! The reconciler only sees the [`BlockTable`] capability: read the live
//! members of the block table, add or remove one member, and assert that a
//! numbered rule exists. The live filter is always the ground truth; no
//! backend caches membership between calls.

mod ipfw;
mod memory;
mod nftables;

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

pub use ipfw::IpfwTable;
pub use memory::{MemoryTable, TableOp};
pub use nftables::NftablesTable;

use crate::cmd_abstraction::RealCommandExecutor;
use crate::config::{
    AgentConfig, Backend, AUTHORITY_RULE_PRIORITY, DEFAULT_ALLOW_PRIORITY, MANAGEMENT_RULE_BASE,
};
use crate::error::BlocksyncError;

/// What a baseline rule matches and does.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RulePredicate {
    AllowLoopback,
    AllowEstablished,
    AllowOutbound,
    AllowTcpPort(u16),
    AllowUdpPort(u16),
    /// Traffic from a must-stay-reachable host or range
    AllowSource(IpNet),
    /// Drop traffic from members of the block table
    DenyTable,
    AllowAll,
}

impl fmt::Display for RulePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RulePredicate::AllowLoopback => write!(f, "allow loopback"),
            RulePredicate::AllowEstablished => write!(f, "allow established"),
            RulePredicate::AllowOutbound => write!(f, "allow outbound"),
            RulePredicate::AllowTcpPort(port) => write!(f, "allow tcp/{}", port),
            RulePredicate::AllowUdpPort(port) => write!(f, "allow udp/{}", port),
            RulePredicate::AllowSource(net) => write!(f, "allow from {}", net),
            RulePredicate::DenyTable => write!(f, "deny block table"),
            RulePredicate::AllowAll => write!(f, "default allow"),
        }
    }
}

/// A rule asserted every cycle, ordered by priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineRule {
    pub priority: u32,
    pub predicate: RulePredicate,
}

impl BaselineRule {
    pub fn new(priority: u32, predicate: RulePredicate) -> Self {
        Self { priority, predicate }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleStatus {
    Present,
    Added,
    /// The backend has no equivalent (e.g. nftables needs no outbound rule
    /// on an input hook)
    NotApplicable,
}

/// Live block table of one enforcement point.
#[async_trait]
pub trait BlockTable: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Current members, read from the live filter
    async fn list_members(&self) -> Result<BTreeSet<IpNet>>;

    async fn add(&self, member: &IpNet) -> Result<()>;

    async fn remove(&self, member: &IpNet) -> Result<()>;

    /// Make sure a rule with this priority exists; idempotent.
    async fn ensure_rule(&self, priority: u32, predicate: &RulePredicate) -> Result<RuleStatus>;
}

/// The ordered safety rules for an agent. `protected` are the
/// must-stay-reachable networks (the authority's addresses first).
pub fn baseline_rules(agent: &AgentConfig, protected: &[IpNet]) -> Vec<BaselineRule> {
    let mut rules = vec![
        BaselineRule::new(100, RulePredicate::AllowLoopback),
        BaselineRule::new(200, RulePredicate::AllowEstablished),
        BaselineRule::new(300, RulePredicate::AllowOutbound),
    ];

    if agent.dns {
        rules.push(BaselineRule::new(400, RulePredicate::AllowUdpPort(53)));
    }

    for (i, port) in agent.management_ports.iter().enumerate() {
        rules.push(BaselineRule::new(
            MANAGEMENT_RULE_BASE + i as u32,
            RulePredicate::AllowTcpPort(*port),
        ));
    }

    let slots = agent.block_rule.saturating_sub(AUTHORITY_RULE_PRIORITY) as usize;
    if protected.len() > slots {
        warn!(
            "{} protected networks but only {} rule slots below block rule {}; extra entries get no allow rule",
            protected.len(),
            slots,
            agent.block_rule
        );
    }
    for (i, net) in protected.iter().take(slots).enumerate() {
        rules.push(BaselineRule::new(
            AUTHORITY_RULE_PRIORITY + i as u32,
            RulePredicate::AllowSource(*net),
        ));
    }

    rules.push(BaselineRule::new(agent.block_rule, RulePredicate::DenyTable));
    rules.push(BaselineRule::new(DEFAULT_ALLOW_PRIORITY, RulePredicate::AllowAll));
    rules
}

/// Create the block table for the configured backend
pub fn create_table(agent: &AgentConfig) -> Arc<dyn BlockTable> {
    match agent.backend {
        Backend::Ipfw => Arc::new(IpfwTable::new(RealCommandExecutor::new(), agent.ipfw_table)),
        Backend::Nftables => Arc::new(NftablesTable::new(RealCommandExecutor::new())),
    }
}

/// Check if running as root (effective UID == 0)
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        return Err(BlocksyncError::Permission(
            "this operation requires root privileges. Run with sudo, \
             or grant the process CAP_NET_ADMIN"
                .to_string(),
        )
        .into());
    }
    Ok(())
}
