//! Export command: print a rendering of the local store.

use anyhow::Result;
use std::path::Path;

use crate::cli::ExportTarget;
use crate::exporter::{Dialect, ExportFormat, ExportView, Exporter};
use crate::model::ListFilter;
use crate::store::ListStore;

use super::load_config;

/// Run the export command
pub async fn run(
    target: ExportTarget,
    format: &str,
    dialect: &str,
    source: Option<String>,
    config_path: &Path,
) -> Result<()> {
    let config = load_config(config_path)?;
    let store = ListStore::open(&config.authority.database_path)?;
    let exporter = Exporter::new(store);
    let filter = ListFilter {
        source,
        ..ListFilter::default()
    };

    let output = match target {
        ExportTarget::Rules => {
            let dialect = Dialect::parse(dialect, config.agent.ipfw_table).map_err(anyhow::Error::msg)?;
            exporter.rules(&filter, dialect)?.rules.join("\n")
        }
        ExportTarget::Blacklist | ExportTarget::Whitelist => {
            let view = if target == ExportTarget::Blacklist {
                ExportView::EffectiveBlacklist
            } else {
                ExportView::Whitelist
            };
            match format.parse::<ExportFormat>().map_err(anyhow::Error::msg)? {
                ExportFormat::Json => exporter.json(view, &filter)?,
                ExportFormat::Csv => exporter.csv(view, &filter)?,
            }
        }
    };

    println!("{}", output.trim_end());
    Ok(())
}
