//! Core list data model.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two lists the authority maintains.
///
/// Each variant owns its storage handle (see `store`), so list names are never
/// spliced into queries from caller input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    #[default]
    Blacklist,
    Whitelist,
}

impl ListKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListKind::Blacklist => "blacklist",
            ListKind::Whitelist => "whitelist",
        }
    }
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blacklist" | "block" | "blocklist" => Ok(ListKind::Blacklist),
            "whitelist" | "allow" | "allowlist" => Ok(ListKind::Whitelist),
            other => Err(format!(
                "Invalid list '{}'. Valid values: blacklist, whitelist",
                other
            )),
        }
    }
}

/// A stored row of one list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    #[serde(rename = "ip")]
    pub ip_or_cidr: String,
    #[serde(skip_serializing, default)]
    pub list: ListKind,
    pub source: String,
    pub added_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub comment: Option<String>,
}

/// A row ready for `insert_many`, produced by the bulk normalizer.
///
/// `added_at` is captured once per batch, so all rows of one bulk call share it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub ip_or_cidr: String,
    pub source: String,
    pub added_at: DateTime<Utc>,
    pub reason: Option<String>,
    pub comment: Option<String>,
}

/// Result of a single insert. A duplicate key is a reported no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Ordering of list reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListOrder {
    /// Order rows were first inserted
    #[default]
    Insertion,
    /// Numeric address order (IPv4 before IPv6)
    Address,
}

impl FromStr for ListOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insertion" => Ok(ListOrder::Insertion),
            "address" => Ok(ListOrder::Address),
            other => Err(format!("Invalid order '{}'. Valid values: insertion, address", other)),
        }
    }
}

/// Read filter shared by raw list reads and the effective blacklist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub source: Option<String>,
    /// Inclusive lower bound on `added_at`
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `added_at`
    pub to: Option<DateTime<Utc>>,
    pub order: ListOrder,
}

impl ListFilter {
    pub fn by_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }

    pub fn ordered(mut self, order: ListOrder) -> Self {
        self.order = order;
        self
    }
}

/// Timestamps are stored in a fixed-width UTC form so that text comparison in
/// SQL matches chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
