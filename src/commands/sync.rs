//! Sync command: one reconciliation cycle, or a dry-run diff.

use anyhow::Result;
use std::path::Path;

use crate::enforcer::check_root;
use crate::lock::LockGuard;
use crate::reconciler::{CycleOutcome, Plan};

use super::agent::build_reconciler;
use super::load_config;

/// Run the sync command
pub async fn run(dry_run: bool, config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let reconciler = build_reconciler(&config).await?;

    if dry_run {
        let plan = reconciler.plan().await?;
        print_plan(&plan);
        return Ok(());
    }

    check_root()?;
    let _lock = LockGuard::acquire(&config.agent.lock_file)?;
    let report = reconciler.run_cycle().await;

    println!(
        "Added {}, removed {}, restored {} rules, {} failed, {} withheld",
        report.added, report.removed, report.rules_added, report.failures, report.skipped_protected
    );
    match report.outcome {
        CycleOutcome::Converged | CycleOutcome::Applied => Ok(()),
        CycleOutcome::Partial => {
            anyhow::bail!("{} block table changes failed", report.failures)
        }
        CycleOutcome::AuthorityLost => {
            anyhow::bail!("Changes applied but the authority is no longer reachable")
        }
        other => anyhow::bail!("Cycle did not complete: {:?}", other),
    }
}

fn print_plan(plan: &Plan) {
    if plan.diff.is_empty() {
        println!("Block table is in sync");
    }
    for net in &plan.diff.to_remove {
        println!("- {}", net);
    }
    for net in &plan.diff.to_add {
        println!("+ {}", net);
    }
    for net in &plan.skipped_protected {
        println!("! {} (would block a protected address)", net);
    }
    println!(
        "{} to add, {} to remove",
        plan.diff.to_add.len(),
        plan.diff.to_remove.len()
    );
}
