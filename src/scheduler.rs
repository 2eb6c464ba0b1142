//! Periodic feed ingestion on the authority side.

use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::feeds::Feed;
use crate::service::ListService;
use crate::signal::ShutdownToken;

/// Per-tick outcome, by feed name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

pub struct ImportScheduler {
    feeds: Vec<Feed>,
    service: ListService,
    interval: Duration,
}

impl ImportScheduler {
    pub fn new(feeds: Vec<Feed>, service: ListService, interval: Duration) -> Self {
        Self {
            feeds,
            service,
            interval,
        }
    }

    /// Run every feed once, in order. A failing feed does not stop the rest.
    pub async fn run_once(&self) -> TickReport {
        let mut report = TickReport::default();
        for feed in &self.feeds {
            match feed.import(&self.service).await {
                Ok(_) => report.succeeded.push(feed.name.clone()),
                Err(e) => {
                    error!("Feed {} failed: {:#}", feed.name, e);
                    report.failed.push(feed.name.clone());
                }
            }
        }
        report
    }

    /// Tick until shutdown. The first tick fires immediately; ticks missed
    /// while a slow import runs are skipped.
    pub async fn run(&self, shutdown: ShutdownToken) {
        if self.feeds.is_empty() {
            info!("No feeds enabled, import scheduler idle");
            shutdown.cancelled().await;
            return;
        }

        info!(
            "Import scheduler started: {} feed(s) every {:?}",
            self.feeds.len(),
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.run_once().await;
                    info!(
                        "Import tick done: {} ok, {} failed",
                        report.succeeded.len(),
                        report.failed.len()
                    );
                }
            }
        }
        info!("Import scheduler stopped");
    }
}
