//! Configuration management for blocksync.
//!
//! One YAML file carries both roles: the `authority` section configures the
//! list server and its feed importers, the `agent` section configures the
//! reconciler running on each enforcement point. The loaded value is passed
//! explicitly to every component that needs it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::feeds::MAX_FEED_SIZE;
use crate::model::ListKind;
use crate::normalizer::{parse_token, DEFAULT_MAX_EXPANSION};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/blocksync/config.yaml";

/// Priority of the trailing default-allow rule. Every configured rule must
/// sort before it.
pub const DEFAULT_ALLOW_PRIORITY: u32 = 65534;

/// Priority of the authority-host allow rule; management port rules occupy
/// the range below it.
pub const AUTHORITY_RULE_PRIORITY: u32 = 600;
pub const MANAGEMENT_RULE_BASE: u32 = 500;

/// Parse an interval string ("4h", "30m", "1d", "60s") into a duration.
/// Only ASCII input is accepted and zero intervals are rejected.
pub fn parse_interval(interval: &str) -> Option<Duration> {
    if !interval.is_ascii() || interval.len() < 2 {
        return None;
    }

    let (num_part, suffix) = interval.split_at(interval.len() - 1);
    let value: u64 = num_part.parse().ok()?;
    let unit = match suffix {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return None,
    };

    match value.checked_mul(unit) {
        Some(0) | None => None,
        Some(secs) => Some(Duration::from_secs(secs)),
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub authority: AuthorityConfig,
    pub agent: AgentConfig,
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            tracing::debug!(
                "Config file {:?} not found, using defaults",
                path.as_ref()
            );
            Ok(Self::default())
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.authority.validate()?;
        self.agent.validate()?;
        Ok(())
    }

    /// Save configuration to YAML file atomically
    ///
    /// Uses tempfile + rename pattern to prevent corruption on crash.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let path = path.as_ref();
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        let parent_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .context("Failed to create temporary file for config")?;

        temp_file.write_all(content.as_bytes())?;
        temp_file.as_file().sync_all()?;

        temp_file
            .persist(path)
            .with_context(|| format!("Failed to persist config file: {:?}", path))?;

        Ok(())
    }
}

/// List server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Address the HTTP API binds to
    pub listen: String,

    pub database_path: PathBuf,

    /// How often the import scheduler runs the feeds
    pub import_interval: String,

    /// Maximum number of hosts one CIDR token may expand to
    pub max_expansion: u64,

    /// Largest feed download or file accepted, in bytes
    pub max_feed_size: usize,

    pub feeds: Vec<FeedConfig>,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5000".to_string(),
            database_path: PathBuf::from("/var/lib/blocksync/lists.db"),
            import_interval: "300s".to_string(),
            max_expansion: DEFAULT_MAX_EXPANSION,
            max_feed_size: MAX_FEED_SIZE,
            feeds: default_feeds(),
        }
    }
}

impl AuthorityConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", self.listen))
    }

    pub fn import_interval(&self) -> Result<Duration> {
        parse_interval(&self.import_interval).with_context(|| {
            format!(
                "Invalid import_interval '{}'. Use format like '300s', '5m', '1h'",
                self.import_interval
            )
        })
    }

    pub fn enabled_feeds(&self) -> impl Iterator<Item = &FeedConfig> {
        self.feeds.iter().filter(|f| f.enabled)
    }

    fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        self.import_interval()?;

        if self.max_expansion == 0 {
            anyhow::bail!("max_expansion must be greater than zero");
        }
        if self.max_feed_size == 0 {
            anyhow::bail!("max_feed_size must be greater than zero");
        }

        let mut names = HashSet::new();
        for feed in &self.feeds {
            feed.validate()?;
            if !names.insert(feed.name.as_str()) {
                anyhow::bail!("Duplicate feed name '{}'", feed.name);
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    /// Plain-text list downloaded over HTTPS
    #[default]
    Http,
    /// Local file, or every file in a directory
    File,
}

/// One external reputation feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    pub name: String,
    #[serde(default)]
    pub kind: FeedKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub list: ListKind,
    /// Source label stored on imported rows (defaults to the feed name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl FeedConfig {
    pub fn source_label(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }

    fn validate(&self) -> Result<()> {
        // Feed names appear in the /import/{feed} route
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
        {
            anyhow::bail!(
                "Invalid feed name '{}'. Use letters, digits, '-', '_' or '.'",
                self.name
            );
        }

        match self.kind {
            FeedKind::Http => {
                let url = self
                    .url
                    .as_deref()
                    .with_context(|| format!("Feed '{}' requires a url", self.name))?;
                if self.enabled && !url.starts_with("https://") {
                    anyhow::bail!("Feed '{}' URL must use HTTPS: {}", self.name, url);
                }
            }
            FeedKind::File => {
                if self.path.is_none() {
                    anyhow::bail!("Feed '{}' requires a path", self.name);
                }
            }
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_feeds() -> Vec<FeedConfig> {
    vec![
        FeedConfig {
            name: "blocklist_de".to_string(),
            kind: FeedKind::Http,
            url: Some("https://api.blocklist.de/getlast.php?time=3600".to_string()),
            path: None,
            list: ListKind::Blacklist,
            source: Some("blocklist.de".to_string()),
            reason: None,
            comment: Some("Imported from blocklist.de".to_string()),
            enabled: true,
        },
        FeedConfig {
            name: "fail2ban".to_string(),
            kind: FeedKind::File,
            url: None,
            path: Some(PathBuf::from("/var/lib/blocksync/feeds/fail2ban")),
            list: ListKind::Blacklist,
            source: None,
            reason: Some("fail2ban ban".to_string()),
            comment: None,
            enabled: false,
        },
        FeedConfig {
            name: "elastiflow".to_string(),
            kind: FeedKind::File,
            url: None,
            path: Some(PathBuf::from("/var/lib/blocksync/feeds/elastiflow")),
            list: ListKind::Blacklist,
            source: None,
            reason: Some("flow anomaly".to_string()),
            comment: None,
            enabled: false,
        },
    ]
}

/// Firewall backend used on the enforcement point
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// ipfw table plus numbered rules
    Ipfw,
    /// nftables inet table with address sets (default)
    #[default]
    Nftables,
}

/// Enforcement point settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub authority_url: String,

    /// How often the reconciler runs a cycle
    pub sync_interval: String,

    pub backend: Backend,

    /// ipfw table holding blocked addresses
    pub ipfw_table: u32,

    /// Priority of the rule denying traffic from the block table
    pub block_rule: u32,

    /// TCP ports that always stay open (management access)
    pub management_ports: Vec<u16>,

    /// Allow outbound DNS (UDP 53)
    pub dns: bool,

    /// Extra addresses or ranges that must never be blocked
    pub protected: Vec<String>,

    /// Only enforce entries imported under this source label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    pub lock_file: PathBuf,

    /// Timeout for requests to the authority
    pub request_timeout: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            authority_url: "http://localhost:5000".to_string(),
            sync_interval: "60s".to_string(),
            backend: Backend::default(),
            ipfw_table: 2,
            block_rule: 1035,
            management_ports: vec![22],
            dns: true,
            protected: Vec::new(),
            source: None,
            lock_file: PathBuf::from("/var/run/blocksync.lock"),
            request_timeout: "30s".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn sync_interval(&self) -> Result<Duration> {
        parse_interval(&self.sync_interval).with_context(|| {
            format!(
                "Invalid sync_interval '{}'. Use format like '60s', '5m'",
                self.sync_interval
            )
        })
    }

    pub fn request_timeout(&self) -> Result<Duration> {
        parse_interval(&self.request_timeout).with_context(|| {
            format!(
                "Invalid request_timeout '{}'. Use format like '30s'",
                self.request_timeout
            )
        })
    }

    fn validate(&self) -> Result<()> {
        if !self.authority_url.starts_with("http://") && !self.authority_url.starts_with("https://")
        {
            anyhow::bail!(
                "authority_url must use http:// or https://: {}",
                self.authority_url
            );
        }
        reqwest::Url::parse(&self.authority_url)
            .with_context(|| format!("Invalid authority_url '{}'", self.authority_url))?;

        self.sync_interval()?;
        self.request_timeout()?;

        let port_slots = (AUTHORITY_RULE_PRIORITY - MANAGEMENT_RULE_BASE) as usize;
        if self.management_ports.len() > port_slots {
            anyhow::bail!(
                "At most {} management ports are supported, got {}",
                port_slots,
                self.management_ports.len()
            );
        }

        if self.block_rule <= AUTHORITY_RULE_PRIORITY || self.block_rule >= DEFAULT_ALLOW_PRIORITY {
            anyhow::bail!(
                "block_rule must be between {} and {} (exclusive), got {}",
                AUTHORITY_RULE_PRIORITY,
                DEFAULT_ALLOW_PRIORITY,
                self.block_rule
            );
        }

        for entry in &self.protected {
            parse_token(entry)
                .with_context(|| format!("Invalid protected address '{}'", entry))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.authority.listen, "0.0.0.0:5000");
        assert_eq!(config.authority.max_expansion, 65536);
        assert_eq!(config.agent.backend, Backend::Nftables);
        assert_eq!(config.agent.ipfw_table, 2);
        assert_eq!(config.agent.block_rule, 1035);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_feeds() {
        let config = AuthorityConfig::default();
        let enabled: Vec<&str> = config.enabled_feeds().map(|f| f.name.as_str()).collect();
        assert_eq!(enabled, vec!["blocklist_de"]);
        let labels: Vec<&str> = config.feeds.iter().map(|f| f.source_label()).collect();
        assert_eq!(labels, vec!["blocklist.de", "fail2ban", "elastiflow"]);
        assert_eq!(config.max_feed_size, MAX_FEED_SIZE);
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("60s"), Some(Duration::from_secs(60)));
        assert_eq!(parse_interval("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_interval("4h"), Some(Duration::from_secs(14400)));
        assert_eq!(parse_interval("1d"), Some(Duration::from_secs(86400)));

        assert_eq!(parse_interval(""), None);
        assert_eq!(parse_interval("h"), None);
        assert_eq!(parse_interval("4"), None);
        assert_eq!(parse_interval("4x"), None);
        assert_eq!(parse_interval("0s"), None);
        assert_eq!(parse_interval("-5m"), None);
    }

    #[test]
    fn test_valid_interval_unicode_rejected() {
        assert!(parse_interval("４h").is_none()); // Full-width digit 4
        assert!(parse_interval("4ℎ").is_none()); // Planck constant symbol
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
agent:
  authority_url: "http://10.0.0.1:5000"
  backend: ipfw
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.agent.backend, Backend::Ipfw);
        assert_eq!(config.agent.sync_interval, "60s");
        assert_eq!(config.authority, AuthorityConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_feed_yaml() {
        let yaml = r#"
feeds:
  - name: local
    kind: file
    path: /tmp/feed.txt
    list: whitelist
"#;
        let authority: AuthorityConfig = serde_yaml::from_str(yaml).unwrap();
        let feed = &authority.feeds[0];
        assert_eq!(feed.kind, FeedKind::File);
        assert_eq!(feed.list, ListKind::Whitelist);
        assert!(feed.enabled);
        assert!(authority.validate().is_ok());
    }

    #[test]
    fn test_validation_http_feed_rejected() {
        let mut config = Config::default();
        config.authority.feeds[0].url = Some("http://insecure.example.com/list".into());
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("HTTPS"));
    }

    #[test]
    fn test_validation_duplicate_feed() {
        let mut config = Config::default();
        let dup = config.authority.feeds[0].clone();
        config.authority.feeds.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_feed_name_injection() {
        let mut config = Config::default();
        config.authority.feeds[0].name = "../etc".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_block_rule_bounds() {
        let mut config = Config::default();
        config.agent.block_rule = 65534;
        assert!(config.validate().is_err());
        config.agent.block_rule = 100;
        assert!(config.validate().is_err());
        config.agent.block_rule = 2000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_authority_url_scheme() {
        let mut config = Config::default();
        config.agent.authority_url = "ftp://example.com".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_protected_entries() {
        let mut config = Config::default();
        config.agent.protected = vec!["10.0.0.0/8".into(), "not-an-ip".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_expansion() {
        let mut config = Config::default();
        config.authority.max_expansion = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = Config::default();
        config.agent.protected = vec!["192.0.2.10".into()];
        config.agent.source = Some("fail2ban".into());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("missing.yaml")).unwrap();
        assert_eq!(config, Config::default());
    }
}
