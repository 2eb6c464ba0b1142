//! CLI command implementations.

pub mod agent;
pub mod export;
pub mod import;
pub mod init;
pub mod serve;
pub mod sync;

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::normalizer::Normalizer;
use crate::service::ListService;
use crate::store::ListStore;

/// Load the config file, or defaults when it does not exist
pub(crate) fn load_config(path: &Path) -> Result<Config> {
    Config::load_or_default(path).with_context(|| format!("Failed to load config from {:?}", path))
}

/// Open the authority store with the configured normalizer
pub(crate) fn open_service(config: &Config) -> Result<ListService> {
    let store = ListStore::open(&config.authority.database_path).with_context(|| {
        format!(
            "Failed to open store {}",
            config.authority.database_path.display()
        )
    })?;
    Ok(ListService::new(store, Normalizer::new(config.authority.max_expansion)))
}
