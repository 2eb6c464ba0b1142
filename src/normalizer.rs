//! Bulk normalizer: address tokens in, single-host rows out.
//!
//! A token is first tried as a host address, then as a CIDR range. Ranges are
//! parsed leniently (host bits are masked off, so `10.0.0.5/30` means
//! `10.0.0.4/30`) and expanded to their usable hosts:
//!
//! - IPv4: network and broadcast excluded, except `/31` (both addresses) and
//!   `/32` (the address itself)
//! - IPv6: the subnet-router anycast address excluded below `/127`
//!
//! Tokens that do not validate are dropped from the batch; only a batch with
//! no valid token at all is an error.

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

use crate::error::NormalizeError;
use crate::model::NewEntry;

/// Default cap on the number of hosts one token may expand to (a /16).
pub const DEFAULT_MAX_EXPANSION: u64 = 65_536;

/// Metadata every row of one batch inherits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchMeta {
    pub source: String,
    pub reason: Option<String>,
    pub comment: Option<String>,
}

impl BatchMeta {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }
}

/// Output of [`Normalizer::normalize`]
#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    pub entries: Vec<NewEntry>,
    pub rejected: Vec<NormalizeError>,
    /// Captured once for the whole batch
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    max_expansion: u64,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EXPANSION)
    }
}

impl Normalizer {
    pub fn new(max_expansion: u64) -> Self {
        Self { max_expansion }
    }

    /// Expand a batch of tokens into rows sharing one timestamp.
    pub fn normalize<I, S>(&self, tokens: I, meta: &BatchMeta) -> Result<NormalizedBatch, NormalizeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let added_at = Utc::now();
        let mut entries = Vec::new();
        let mut rejected = Vec::new();
        let mut accepted = 0usize;

        for token in tokens {
            match self.expand_token(token.as_ref()) {
                Ok(hosts) => {
                    accepted += 1;
                    entries.extend(hosts.into_iter().map(|ip| NewEntry {
                        ip_or_cidr: ip.to_string(),
                        source: meta.source.clone(),
                        added_at,
                        reason: meta.reason.clone(),
                        comment: meta.comment.clone(),
                    }));
                }
                Err(e) => {
                    debug!("Dropping token from batch: {}", e);
                    rejected.push(e);
                }
            }
        }

        if accepted == 0 {
            return Err(NormalizeError::NoValidAddresses {
                rejected: rejected.len(),
            });
        }

        Ok(NormalizedBatch {
            entries,
            rejected,
            added_at,
        })
    }

    /// Validate one token and list the host addresses it stands for.
    pub fn expand_token(&self, token: &str) -> Result<Vec<IpAddr>, NormalizeError> {
        let net = parse_token(token)?;
        let hosts = usable_host_count(&net);
        if hosts > u128::from(self.max_expansion) {
            return Err(NormalizeError::RangeTooLarge {
                token: token.trim().to_string(),
                hosts,
                limit: self.max_expansion,
            });
        }
        Ok(expand(&net))
    }
}

/// Parse a host address or CIDR range. Host bits of a range are masked off.
pub fn parse_token(token: &str) -> Result<IpNet, NormalizeError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(NormalizeError::InvalidAddress(String::new()));
    }
    if let Ok(ip) = token.parse::<IpAddr>() {
        return Ok(IpNet::from(ip));
    }
    token
        .parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|_| NormalizeError::InvalidAddress(token.to_string()))
}

/// Canonical stored form of a single-insert address: hosts as bare addresses,
/// ranges in masked CIDR form.
pub fn canonicalize(token: &str) -> Result<String, NormalizeError> {
    parse_token(token).map(|net| render_net(&net))
}

/// Parse a stored address (host or CIDR) back into a network.
pub fn to_net(stored: &str) -> Option<IpNet> {
    parse_token(stored).ok()
}

pub fn render_net(net: &IpNet) -> String {
    if net.prefix_len() == net.max_prefix_len() {
        net.addr().to_string()
    } else {
        net.to_string()
    }
}

/// Number of addresses [`expand`] would yield, without allocating.
pub fn usable_host_count(net: &IpNet) -> u128 {
    let bits = u32::from(net.max_prefix_len() - net.prefix_len());
    let size = 1u128.checked_shl(bits).unwrap_or(u128::MAX);
    match net {
        IpNet::V4(_) if bits >= 2 => size - 2,
        IpNet::V6(_) if bits >= 2 => size - 1,
        _ => size,
    }
}

/// Usable host addresses of a network, in ascending order.
pub fn expand(net: &IpNet) -> Vec<IpAddr> {
    match net {
        IpNet::V4(v4) => expand_v4(v4).into_iter().map(IpAddr::V4).collect(),
        IpNet::V6(v6) => expand_v6(v6).into_iter().map(IpAddr::V6).collect(),
    }
}

fn expand_v4(net: &Ipv4Net) -> Vec<Ipv4Addr> {
    let first = u32::from(net.network());
    let last = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        return (first..=last).map(Ipv4Addr::from).collect();
    }
    (first + 1..last).map(Ipv4Addr::from).collect()
}

fn expand_v6(net: &Ipv6Net) -> Vec<Ipv6Addr> {
    let first = u128::from(net.network());
    let last = u128::from(net.broadcast());
    if net.prefix_len() >= 127 {
        return (first..=last).map(Ipv6Addr::from).collect();
    }
    (first + 1..=last).map(Ipv6Addr::from).collect()
}
