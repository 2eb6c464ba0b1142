//! nftables backend.
//!
//! Everything lives in one `inet blocksync` table: two interval sets (v4 and
//! v6) and an input chain. Baseline rules carry a `blocksync:<priority>:<n>`
//! comment so they can be found again and inserted in priority order; rules
//! not tagged by us are never touched. Reading membership never writes: a
//! missing table reads as empty and is created when the rules are asserted.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use super::{BlockTable, RulePredicate, RuleStatus};
use crate::cmd_abstraction::{args_to_strings, locate_binary, run_checked, CommandExecutor};
use crate::normalizer::{parse_token, render_net};

const TABLE_NAME: &str = "blocksync";
const SET_NAME: &str = "blocklist";
const SET_NAME_V6: &str = "blocklist_v6";
const CHAIN_NAME: &str = "input";
const RULE_TAG: &str = "blocksync:";

fn nft_path() -> &'static str {
    locate_binary(&["/usr/sbin/nft", "/sbin/nft", "nft"])
}

/// Validate that an IP/CIDR string is safe for nftables script inclusion.
fn is_safe_nft_element(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| {
            c.is_ascii_digit() || c == '.' || c == ':' || c == '/' || ('a'..='f').contains(&c)
        })
}

fn set_for(net: &IpNet) -> &'static str {
    match net {
        IpNet::V4(_) => SET_NAME,
        IpNet::V6(_) => SET_NAME_V6,
    }
}

/// nft reports a missing table or set as ENOENT.
fn is_missing_object(stderr: &str) -> bool {
    stderr.contains("No such file or directory")
}

/// Idempotent creation of the table, sets and chain (`add` never fails on an
/// existing object).
fn structure_script() -> String {
    let mut script = String::new();
    script.push_str(&format!("add table inet {}\n", TABLE_NAME));
    script.push_str(&format!(
        "add set inet {} {} {{ type ipv4_addr; flags interval; }}\n",
        TABLE_NAME, SET_NAME
    ));
    script.push_str(&format!(
        "add set inet {} {} {{ type ipv6_addr; flags interval; }}\n",
        TABLE_NAME, SET_NAME_V6
    ));
    script.push_str(&format!(
        "add chain inet {} {} {{ type filter hook input priority 0; policy accept; }}\n",
        TABLE_NAME, CHAIN_NAME
    ));
    script
}

/// nft statements implementing a predicate. Empty when the input hook
/// needs no rule for it.
fn rule_statements(predicate: &RulePredicate) -> Result<Vec<String>> {
    let statements = match predicate {
        RulePredicate::AllowLoopback => vec!["iifname \"lo\" accept".to_string()],
        RulePredicate::AllowEstablished => vec!["ct state established,related accept".to_string()],
        RulePredicate::AllowOutbound => Vec::new(),
        RulePredicate::AllowTcpPort(port) => vec![format!("tcp dport {} accept", port)],
        RulePredicate::AllowUdpPort(port) => vec![format!("udp dport {} accept", port)],
        RulePredicate::AllowSource(net) => {
            let element = render_net(net);
            if !is_safe_nft_element(&element) {
                anyhow::bail!("Refusing unsafe nftables element: {}", element);
            }
            let family = match net {
                IpNet::V4(_) => "ip",
                IpNet::V6(_) => "ip6",
            };
            vec![format!("{} saddr {} accept", family, element)]
        }
        RulePredicate::DenyTable => vec![
            format!("ip saddr @{} counter drop", SET_NAME),
            format!("ip6 saddr @{} counter drop", SET_NAME_V6),
        ],
        RulePredicate::AllowAll => vec!["accept".to_string()],
    };
    Ok(statements)
}

/// Members listed in `nft list set` output. The element block may span
/// several lines.
fn parse_set_elements(output: &str) -> BTreeSet<IpNet> {
    let Some(start) = output.find("elements = {") else {
        return BTreeSet::new();
    };
    let body = &output[start + "elements = {".len()..];
    let body = match body.find('}') {
        Some(end) => &body[..end],
        None => body,
    };

    body.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .filter_map(|token| match parse_token(token) {
            Ok(net) => Some(net),
            Err(_) => {
                debug!("Ignoring nft set element: {}", token);
                None
            }
        })
        .collect()
}

/// A baseline rule found in the chain listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TaggedRule {
    priority: u32,
    index: u32,
    handle: u64,
}

/// Tagged rules from `nft -a list chain` output, sorted by (priority, index).
fn parse_tagged_rules(listing: &str) -> Vec<TaggedRule> {
    let mut rules: Vec<TaggedRule> = listing
        .lines()
        .filter_map(|line| {
            let tag_start = line.find(&format!("comment \"{}", RULE_TAG))?;
            let tag = &line[tag_start + "comment \"".len() + RULE_TAG.len()..];
            let tag = &tag[..tag.find('"')?];
            let (priority, index) = tag.split_once(':')?;

            let handle_start = line.find("# handle ")?;
            let handle = line[handle_start + "# handle ".len()..].trim();

            Some(TaggedRule {
                priority: priority.parse().ok()?,
                index: index.parse().ok()?,
                handle: handle.parse().ok()?,
            })
        })
        .collect();
    rules.sort();
    rules
}

pub struct NftablesTable<E: CommandExecutor> {
    executor: E,
}

impl<E: CommandExecutor> NftablesTable<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    fn exec_nft_script(&self, script: &str) -> Result<()> {
        debug!("Executing nft script:\n{}", script);
        let args = args_to_strings(&["-f", "-"]);
        self.executor
            .execute_with_stdin(nft_path(), &args, script)?
            .into_stdout("nft")?;
        Ok(())
    }

    fn ensure_structure(&self) -> Result<()> {
        self.exec_nft_script(&structure_script())
            .context("Failed to create nftables table")
    }

    fn list_set(&self, set: &str) -> Result<BTreeSet<IpNet>> {
        let args = args_to_strings(&["list", "set", "inet", TABLE_NAME, set]);
        let output = self.executor.execute(nft_path(), &args)?;
        if !output.success && is_missing_object(&output.stderr) {
            debug!("nftables set {} does not exist yet", set);
            return Ok(BTreeSet::new());
        }
        let listing = output
            .into_stdout("nft")
            .with_context(|| format!("Failed to list nftables set {}", set))?;
        Ok(parse_set_elements(&listing))
    }

    fn element_op(&self, op: &str, member: &IpNet) -> Result<()> {
        let element = render_net(member);
        if !is_safe_nft_element(&element) {
            warn!("Filtered unsafe nftables element: {}", element);
            anyhow::bail!("Refusing unsafe nftables element: {}", element);
        }
        run_checked(
            &self.executor,
            nft_path(),
            &[op, "element", "inet", TABLE_NAME, set_for(member), "{", &element, "}"],
        )?;
        Ok(())
    }
}

#[async_trait]
impl<E: CommandExecutor> BlockTable for NftablesTable<E> {
    fn name(&self) -> &'static str {
        "nftables"
    }

    async fn list_members(&self) -> Result<BTreeSet<IpNet>> {
        let mut members = self.list_set(SET_NAME)?;
        members.extend(self.list_set(SET_NAME_V6)?);
        Ok(members)
    }

    async fn add(&self, member: &IpNet) -> Result<()> {
        self.element_op("add", member)
    }

    async fn remove(&self, member: &IpNet) -> Result<()> {
        self.element_op("delete", member)
    }

    async fn ensure_rule(&self, priority: u32, predicate: &RulePredicate) -> Result<RuleStatus> {
        let statements = rule_statements(predicate)?;
        if statements.is_empty() {
            return Ok(RuleStatus::NotApplicable);
        }

        self.ensure_structure()?;
        let listing = run_checked(
            &self.executor,
            nft_path(),
            &["-a", "list", "chain", "inet", TABLE_NAME, CHAIN_NAME],
        )
        .context("Failed to list nftables chain")?;
        let mut existing = parse_tagged_rules(&listing);

        let mut added = false;
        for (index, statement) in statements.iter().enumerate() {
            let index = index as u32;
            if existing
                .iter()
                .any(|r| r.priority == priority && r.index == index)
            {
                continue;
            }

            let tagged = format!("{} comment \"{}{}:{}\"", statement, RULE_TAG, priority, index);
            // Insert before the first rule that sorts after this one
            let next = existing
                .iter()
                .find(|r| (r.priority, r.index) > (priority, index))
                .copied();
            let script = match next {
                Some(rule) => format!(
                    "insert rule inet {} {} position {} {}\n",
                    TABLE_NAME, CHAIN_NAME, rule.handle, tagged
                ),
                None => format!("add rule inet {} {} {}\n", TABLE_NAME, CHAIN_NAME, tagged),
            };
            self.exec_nft_script(&script)
                .with_context(|| format!("Failed to add nftables rule {}: {}", priority, statement))?;
            info!("Added nftables rule {}: {}", priority, statement);

            // Later statements of this predicate sort after this one; the
            // handle is not needed for them.
            existing.push(TaggedRule {
                priority,
                index,
                handle: next.map_or(0, |r| r.handle),
            });
            existing.sort();
            added = true;
        }

        Ok(if added {
            RuleStatus::Added
        } else {
            RuleStatus::Present
        })
    }
}
