//! Agent-side client for the authority's read interface and health probe.

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use reqwest::{Client, Url};
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

use crate::error::BlocksyncError;
use crate::exporter::EffectiveBlockSet;
use crate::normalizer::parse_token;

/// What the reconciler needs from the authority.
#[async_trait]
pub trait Authority: Send + Sync {
    async fn effective_blacklist(&self) -> Result<EffectiveBlockSet>;

    /// Liveness check used after mutating the filter.
    async fn probe(&self) -> Result<()>;
}

pub struct HttpAuthority {
    client: Client,
    base: Url,
    source: Option<String>,
}

impl HttpAuthority {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("Invalid authority URL: {}", base_url))?;
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("blocksync-agent/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            base,
            source: None,
        })
    }

    /// Restrict the fetched block set to one source
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("Invalid endpoint {} on {}", path, self.base))
    }
}

#[async_trait]
impl Authority for HttpAuthority {
    async fn effective_blacklist(&self) -> Result<EffectiveBlockSet> {
        let mut url = self.endpoint("/export/iptables")?;
        if let Some(source) = &self.source {
            url.query_pairs_mut().append_pair("source", source);
        }
        debug!("Fetching block set from {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Authority unreachable")?;
        if !response.status().is_success() {
            return Err(BlocksyncError::AuthorityUnreachable(format!("HTTP {}", response.status())).into());
        }
        let set: EffectiveBlockSet = response
            .json()
            .await
            .context("Malformed block set from authority")?;
        Ok(set)
    }

    async fn probe(&self) -> Result<()> {
        let response = self
            .client
            .get(self.endpoint("/health")?)
            .send()
            .await
            .context("Authority unreachable")?;
        if !response.status().is_success() {
            return Err(BlocksyncError::AuthorityUnreachable(format!(
                "health check returned HTTP {}",
                response.status()
            ))
            .into());
        }
        Ok(())
    }
}

/// Networks the agent must never block: the authority's own address(es)
/// plus any configured extras.
pub async fn resolve_protected(authority_url: &str, extra: &[String]) -> Result<Vec<IpNet>> {
    let url = Url::parse(authority_url).with_context(|| format!("Invalid authority URL: {}", authority_url))?;
    let host = url
        .host_str()
        .with_context(|| format!("Authority URL has no host: {}", authority_url))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let mut protected = Vec::new();
    match host.parse::<IpAddr>() {
        Ok(addr) => protected.push(IpNet::from(addr)),
        Err(_) => {
            let port = url.port_or_known_default().unwrap_or(80);
            let addrs = tokio::net::lookup_host((host, port))
                .await
                .with_context(|| format!("Failed to resolve authority host {}", host))?;
            for addr in addrs {
                let net = IpNet::from(addr.ip());
                if !protected.contains(&net) {
                    protected.push(net);
                }
            }
        }
    }

    for entry in extra {
        let net = parse_token(entry).with_context(|| format!("Invalid protected address {}", entry))?;
        if !protected.contains(&net) {
            protected.push(net);
        }
    }
    Ok(protected)
}
