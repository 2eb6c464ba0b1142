//! Init command: write a default configuration file.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;

/// Run the init command
pub async fn run(force: bool, config_path: &Path) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file {:?} already exists (use --force to overwrite)",
            config_path
        );
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    Config::default().save(config_path)?;
    println!("Wrote default configuration to {}", config_path.display());
    Ok(())
}
