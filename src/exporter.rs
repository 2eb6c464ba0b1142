//! Read-only renderings of the lists.
//!
//! Every call reads the store afresh; nothing is cached and nothing is
//! written back.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::{ExportError, StoreError};
use crate::model::{format_timestamp, ListEntry, ListFilter, ListKind};
use crate::normalizer::to_net;
use crate::store::ListStore;

/// CSV column order
pub const CSV_HEADER: [&str; 5] = ["ip", "source", "added_at", "reason", "comment"];

/// Which derived view to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportView {
    /// Blacklist with whitelist precedence applied
    EffectiveBlacklist,
    /// Raw whitelist rows
    Whitelist,
}

impl From<ListKind> for ExportView {
    fn from(kind: ListKind) -> Self {
        match kind {
            ListKind::Blacklist => ExportView::EffectiveBlacklist,
            ListKind::Whitelist => ExportView::Whitelist,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("Invalid format '{}'. Valid values: json, csv", other)),
        }
    }
}

/// Packet-filter dialect for directive rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Iptables,
    Ipfw { table: u32 },
    Nftables,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Iptables => "iptables",
            Dialect::Ipfw { .. } => "ipfw",
            Dialect::Nftables => "nftables",
        }
    }

    /// Parse a dialect name; `ipfw_table` is used for the ipfw dialect.
    pub fn parse(name: &str, ipfw_table: u32) -> Result<Self, String> {
        match name.to_ascii_lowercase().as_str() {
            "iptables" => Ok(Dialect::Iptables),
            "ipfw" => Ok(Dialect::Ipfw { table: ipfw_table }),
            "nftables" | "nft" => Ok(Dialect::Nftables),
            other => Err(format!(
                "Invalid dialect '{}'. Valid values: iptables, ipfw, nftables",
                other
            )),
        }
    }

    /// One directive for `net`, annotated with its source.
    pub fn directive(&self, net: &IpNet, source: &str) -> String {
        let body = match (self, net) {
            (Dialect::Iptables, IpNet::V4(_)) => format!("iptables -A INPUT -s {} -j DROP", net),
            (Dialect::Iptables, IpNet::V6(_)) => format!("ip6tables -A INPUT -s {} -j DROP", net),
            (Dialect::Ipfw { table }, _) => format!("ipfw table {} add {}", table, net),
            (Dialect::Nftables, IpNet::V4(_)) => {
                format!("nft add element inet blocksync blocklist {{ {} }}", net)
            }
            (Dialect::Nftables, IpNet::V6(_)) => {
                format!("nft add element inet blocksync blocklist_v6 {{ {} }}", net)
            }
        };
        format!("{} # {}", body, source)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The authority read interface payload consumed by agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveBlockSet {
    pub count: usize,
    pub ips: Vec<String>,
    #[serde(default = "plain_format")]
    pub format: String,
}

fn plain_format() -> String {
    "plain".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub count: usize,
    pub rules: Vec<String>,
    pub format: String,
}

/// Renders store contents for operators and agents.
#[derive(Clone)]
pub struct Exporter {
    store: ListStore,
}

impl Exporter {
    pub fn new(store: ListStore) -> Self {
        Self { store }
    }

    pub fn records(&self, view: ExportView, filter: &ListFilter) -> Result<Vec<ListEntry>, StoreError> {
        match view {
            ExportView::EffectiveBlacklist => self.store.effective_blacklist(filter),
            ExportView::Whitelist => self.store.list(ListKind::Whitelist, filter),
        }
    }

    pub fn json(&self, view: ExportView, filter: &ListFilter) -> Result<String, ExportError> {
        let records = self.records(view, filter)?;
        serde_json::to_string_pretty(&records).map_err(|e| ExportError::Render(e.to_string()))
    }

    pub fn csv(&self, view: ExportView, filter: &ListFilter) -> Result<String, ExportError> {
        let records = self.records(view, filter)?;
        render_csv(&records)
    }

    pub fn block_set(&self, filter: &ListFilter) -> Result<EffectiveBlockSet, StoreError> {
        let ips: Vec<String> = self
            .store
            .effective_blacklist(filter)?
            .into_iter()
            .map(|entry| entry.ip_or_cidr)
            .collect();
        Ok(EffectiveBlockSet {
            count: ips.len(),
            ips,
            format: plain_format(),
        })
    }

    /// Directives for the effective blacklist in one dialect.
    pub fn rules(&self, filter: &ListFilter, dialect: Dialect) -> Result<RuleSet, StoreError> {
        let entries = self.store.effective_blacklist(filter)?;
        let rules = render_rules(&entries, dialect);
        Ok(RuleSet {
            count: rules.len(),
            rules,
            format: dialect.name().to_string(),
        })
    }
}

/// CSV with a header row; absent optional fields render as empty cells.
pub fn render_csv(records: &[ListEntry]) -> Result<String, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(CSV_HEADER)
        .map_err(|e| ExportError::Render(e.to_string()))?;

    for entry in records {
        let added_at = format_timestamp(&entry.added_at);
        writer
            .write_record([
                entry.ip_or_cidr.as_str(),
                entry.source.as_str(),
                added_at.as_str(),
                entry.reason.as_deref().unwrap_or(""),
                entry.comment.as_deref().unwrap_or(""),
            ])
            .map_err(|e| ExportError::Render(e.to_string()))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| ExportError::Render(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| ExportError::Render(e.to_string()))
}

pub fn render_rules(entries: &[ListEntry], dialect: Dialect) -> Vec<String> {
    entries
        .iter()
        .filter_map(|entry| match to_net(&entry.ip_or_cidr) {
            Some(net) => Some(dialect.directive(&net, &entry.source)),
            None => {
                warn!("Skipping unparsable stored address: {}", entry.ip_or_cidr);
                None
            }
        })
        .collect()
}
