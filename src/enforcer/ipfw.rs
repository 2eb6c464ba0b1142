//! ipfw backend: blocked addresses live in a numbered table, and the baseline
//! rules are plain numbered ipfw rules.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::BTreeSet;
use tracing::{debug, info};

use super::{BlockTable, RulePredicate, RuleStatus};
use crate::cmd_abstraction::{args_to_strings, locate_binary, run_checked, CommandExecutor};
use crate::normalizer::parse_token;

fn ipfw_path() -> &'static str {
    locate_binary(&["/sbin/ipfw", "/usr/sbin/ipfw", "ipfw"])
}

pub struct IpfwTable<E: CommandExecutor> {
    executor: E,
    table: u32,
}

impl<E: CommandExecutor> IpfwTable<E> {
    pub fn new(executor: E, table: u32) -> Self {
        Self { executor, table }
    }

    /// ipfw rule body for a predicate
    fn rule_body(&self, predicate: &RulePredicate) -> String {
        match predicate {
            RulePredicate::AllowLoopback => "allow ip from any to any via lo0".to_string(),
            RulePredicate::AllowEstablished => "allow ip from any to any established".to_string(),
            RulePredicate::AllowOutbound => "allow ip from any to any out keep-state".to_string(),
            RulePredicate::AllowTcpPort(port) => {
                format!("allow tcp from any to any {} keep-state", port)
            }
            RulePredicate::AllowUdpPort(port) => {
                format!("allow udp from any to any {} keep-state", port)
            }
            RulePredicate::AllowSource(net) => format!("allow ip from {} to any", net),
            RulePredicate::DenyTable => format!("deny ip from table({}) to any", self.table),
            RulePredicate::AllowAll => "allow ip from any to any".to_string(),
        }
    }

    /// Any failure other than "rule does not exist" is an error: ipfw
    /// accepts duplicate rule numbers, so adding blindly would stack copies.
    fn rule_exists(&self, priority: u32) -> Result<bool> {
        let args = args_to_strings(&["show", &priority.to_string()]);
        let output = self.executor.execute(ipfw_path(), &args)?;
        if !output.success && output.stderr.contains("does not exist") {
            return Ok(false);
        }
        let listing = output.into_stdout("ipfw")?;
        Ok(listing_has_rule(&listing, priority))
    }

    fn table_arg(&self) -> String {
        self.table.to_string()
    }
}

/// Whether an `ipfw show` listing contains rule number `priority`.
fn listing_has_rule(listing: &str, priority: u32) -> bool {
    listing.lines().any(|line| {
        line.split_whitespace()
            .next()
            .and_then(|num| num.parse::<u32>().ok())
            == Some(priority)
    })
}

/// Parse `ipfw table N list` output ("10.0.0.1/32 0" per line).
fn parse_table_listing(listing: &str) -> BTreeSet<IpNet> {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|token| match parse_token(token) {
            Ok(net) => Some(net),
            Err(_) => {
                // Header lines such as "--- table(2), set(0) ---"
                debug!("Ignoring ipfw table line token: {}", token);
                None
            }
        })
        .collect()
}

#[async_trait]
impl<E: CommandExecutor> BlockTable for IpfwTable<E> {
    fn name(&self) -> &'static str {
        "ipfw"
    }

    async fn list_members(&self) -> Result<BTreeSet<IpNet>> {
        let table = self.table_arg();
        let listing = run_checked(&self.executor, ipfw_path(), &["table", &table, "list"])
            .with_context(|| format!("Failed to list ipfw table {}", self.table))?;
        Ok(parse_table_listing(&listing))
    }

    async fn add(&self, member: &IpNet) -> Result<()> {
        let table = self.table_arg();
        let member = member.to_string();
        run_checked(&self.executor, ipfw_path(), &["table", &table, "add", &member])?;
        debug!("Added {} to ipfw table {}", member, table);
        Ok(())
    }

    async fn remove(&self, member: &IpNet) -> Result<()> {
        let table = self.table_arg();
        let member = member.to_string();
        run_checked(&self.executor, ipfw_path(), &["table", &table, "delete", &member])?;
        debug!("Removed {} from ipfw table {}", member, table);
        Ok(())
    }

    async fn ensure_rule(&self, priority: u32, predicate: &RulePredicate) -> Result<RuleStatus> {
        let exists = self
            .rule_exists(priority)
            .with_context(|| format!("Failed to query ipfw rule {}", priority))?;
        if exists {
            return Ok(RuleStatus::Present);
        }

        let body = self.rule_body(predicate);
        let priority_arg = priority.to_string();
        let mut args = vec!["-q", "add", priority_arg.as_str()];
        args.extend(body.split_whitespace());
        run_checked(&self.executor, ipfw_path(), &args)
            .with_context(|| format!("Failed to add ipfw rule {}: {}", priority, body))?;

        info!("Added ipfw rule {}: {}", priority, body);
        Ok(RuleStatus::Added)
    }
}
