//! Import command: bulk import into the local store.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::feeds::parse_feed;
use crate::model::ListKind;
use crate::normalizer::BatchMeta;

use super::{load_config, open_service};

pub struct ImportArgs {
    pub list: ListKind,
    pub ips: Vec<String>,
    pub file: Option<PathBuf>,
    pub source: String,
    pub reason: Option<String>,
    pub comment: Option<String>,
}

/// Run the import command
pub async fn run(args: ImportArgs, config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let service = open_service(&config)?;

    let mut tokens = args.ips;
    if let Some(file) = &args.file {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        tokens.extend(parse_feed(&content));
    }

    let meta = BatchMeta {
        source: args.source,
        reason: args.reason,
        comment: args.comment,
    };
    let list = args.list;
    let summary = tokio::task::spawn_blocking(move || service.import_bulk(list, tokens, &meta))
        .await
        .context("Import task panicked")??;

    println!("{}", summary.message);
    Ok(())
}
