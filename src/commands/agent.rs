//! Agent command: the reconciliation loop on an enforcement point.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::authority::{resolve_protected, HttpAuthority};
use crate::config::Config;
use crate::enforcer::{baseline_rules, check_root, create_table};
use crate::lock::LockGuard;
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::signal::{ShutdownGuard, ShutdownToken};

use super::load_config;

/// Wire a reconciler from the `agent` section: authority client, backend,
/// protected networks and baseline rules.
pub async fn build_reconciler(config: &Config) -> Result<Reconciler> {
    let agent = &config.agent;
    let protected = resolve_protected(&agent.authority_url, &agent.protected)
        .await
        .context("Cannot determine protected addresses")?;
    info!(
        "Protected from blocking: {}",
        protected
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut authority = HttpAuthority::new(&agent.authority_url, agent.request_timeout()?)?;
    if let Some(source) = &agent.source {
        info!("Enforcing only entries from source {}", source);
        authority = authority.with_source(source.clone());
    }
    let table = create_table(agent);
    let reconciler_config = ReconcilerConfig {
        baseline: baseline_rules(agent, &protected),
        protected,
        interval: agent.sync_interval()?,
    };
    Ok(Reconciler::new(reconciler_config, Arc::new(authority), table))
}

/// Run the agent command
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;
    let config = load_config(config_path)?;
    let _lock = LockGuard::acquire(&config.agent.lock_file)?;

    let reconciler = build_reconciler(&config).await?;
    let shutdown = ShutdownToken::new();
    let _signals = ShutdownGuard::new(shutdown.clone());

    reconciler.run(shutdown).await;
    Ok(())
}
