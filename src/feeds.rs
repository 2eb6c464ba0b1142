//! External reputation feed importers.
//!
//! A feed produces raw address tokens (one per line, `#` comments allowed);
//! the tokens go through the bulk normalizer and insert-or-ignore like any
//! other bulk import. Deduplication is left entirely to the store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{AuthorityConfig, FeedConfig, FeedKind};
use crate::error::BlocksyncError;
use crate::model::ListKind;
use crate::normalizer::BatchMeta;
use crate::service::{ImportSummary, ListService};

const TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 2000;

/// Maximum size of one feed download or file (10 MB)
pub const MAX_FEED_SIZE: usize = 10 * 1024 * 1024;

/// Where a feed's tokens come from.
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch(&self) -> Result<Vec<String>>;
}

/// HTTP client for feeds with the default timeout
pub fn default_client() -> Result<Client> {
    http_client(Duration::from_secs(TIMEOUT_SECS))
}

/// Build the HTTP client shared by feeds
pub fn http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(format!("blocksync/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")
}

/// Plain-text list downloaded over HTTP(S), with retry and a size cap.
pub struct HttpFeed {
    client: Client,
    url: String,
    max_size: usize,
    retry_delay: Duration,
}

impl HttpFeed {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            max_size: MAX_FEED_SIZE,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn fetch_with_retry(&self) -> Result<String> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1));
                debug!("Retry {} after {:?} for {}", attempt, delay, self.url);
                tokio::time::sleep(delay).await;
            }

            match self.client.get(&self.url).send().await {
                Ok(response) if response.status().is_success() => {
                    return self.read_capped(response).await;
                }
                Ok(response) => {
                    last_error = Some(anyhow::anyhow!("HTTP {}", response.status()));
                }
                Err(e) => {
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Unknown error")))
    }

    /// Read the body, giving up as soon as it exceeds the size cap.
    async fn read_capped(&self, mut response: reqwest::Response) -> Result<String> {
        if let Some(content_length) = response.content_length() {
            if content_length as usize > self.max_size {
                anyhow::bail!(
                    "Response too large: {} bytes (max: {} bytes)",
                    content_length,
                    self.max_size
                );
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed to read response body")?
        {
            if body.len() + chunk.len() > self.max_size {
                anyhow::bail!("Downloaded content too large (max: {} bytes)", self.max_size);
            }
            body.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
impl FeedSource for HttpFeed {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self) -> Result<Vec<String>> {
        let content = self.fetch_with_retry().await?;
        Ok(parse_feed(&content))
    }
}

/// A local text file, or every regular file in a directory (sorted by name).
pub struct FileFeed {
    path: PathBuf,
    max_size: usize,
}

impl FileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_size: MAX_FEED_SIZE,
        }
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    async fn read_file(&self, path: &Path) -> Result<String> {
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        if meta.len() as usize > self.max_size {
            anyhow::bail!(
                "Feed file {} too large: {} bytes (max: {} bytes)",
                path.display(),
                meta.len(),
                self.max_size
            );
        }
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }
}

#[async_trait]
impl FeedSource for FileFeed {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self) -> Result<Vec<String>> {
        let meta = tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("Feed path {} not accessible", self.path.display()))?;

        if !meta.is_dir() {
            return Ok(parse_feed(&self.read_file(&self.path).await?));
        }

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.path)
            .await
            .with_context(|| format!("Failed to list {}", self.path.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();

        let mut tokens = Vec::new();
        for file in files {
            tokens.extend(parse_feed(&self.read_file(&file).await?));
        }
        Ok(tokens)
    }
}

/// Extract one address token per line: the first field of the line, so
/// CSV exports and "ip count" style listings work too.
pub fn parse_feed(content: &str) -> Vec<String> {
    content
        .trim_start_matches('\u{feff}')
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            line.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                .next()
                .map(|field| field.trim_matches('"').to_string())
        })
        .filter(|token| !token.is_empty())
        .collect()
}

/// A named feed bound to its target list.
pub struct Feed {
    pub name: String,
    pub list: ListKind,
    pub meta: BatchMeta,
    source: Box<dyn FeedSource>,
}

impl Feed {
    pub fn new(name: impl Into<String>, list: ListKind, meta: BatchMeta, source: Box<dyn FeedSource>) -> Self {
        Self {
            name: name.into(),
            list,
            meta,
            source,
        }
    }

    pub fn from_config(config: &FeedConfig, client: &Client, max_size: usize) -> Result<Self> {
        let source: Box<dyn FeedSource> = match config.kind {
            FeedKind::Http => {
                let url = config.url.as_deref().ok_or_else(|| {
                    BlocksyncError::Config(format!("feed '{}' has no url", config.name))
                })?;
                Box::new(HttpFeed::new(client.clone(), url).with_max_size(max_size))
            }
            FeedKind::File => {
                let path = config.path.as_deref().ok_or_else(|| {
                    BlocksyncError::Config(format!("feed '{}' has no path", config.name))
                })?;
                Box::new(FileFeed::new(path).with_max_size(max_size))
            }
        };

        let meta = BatchMeta {
            source: config.source_label().to_string(),
            reason: config.reason.clone(),
            comment: config.comment.clone(),
        };
        Ok(Self::new(config.name.clone(), config.list, meta, source))
    }

    /// Fetch the feed and bulk-import it.
    pub async fn import(&self, service: &ListService) -> Result<ImportSummary> {
        info!("Importing feed {} from {}", self.name, self.source.describe());
        let tokens = self
            .source
            .fetch()
            .await
            .with_context(|| format!("Failed to fetch feed {}", self.name))?;

        if tokens.is_empty() {
            info!("Feed {} returned no addresses", self.name);
            return Ok(ImportSummary {
                message: format!("Feed {} returned no addresses", self.name),
                inserted: 0,
                rejected: Some(0),
            });
        }

        let service = service.clone();
        let list = self.list;
        let meta = self.meta.clone();
        let summary = tokio::task::spawn_blocking(move || service.import_bulk(list, tokens, &meta))
            .await
            .context("Feed import task panicked")?
            .with_context(|| format!("Failed to import feed {}", self.name))?;

        info!("Feed {}: {}", self.name, summary.message);
        Ok(summary)
    }
}

/// Build every enabled feed from configuration.
pub fn build_feeds(config: &AuthorityConfig, client: &Client) -> Result<Vec<Feed>> {
    config
        .enabled_feeds()
        .map(|feed| Feed::from_config(feed, client, config.max_feed_size))
        .collect()
}
