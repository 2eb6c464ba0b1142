//! CLI argument parsing with clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::model::ListKind;

#[derive(Parser)]
#[command(name = "blocksync")]
#[command(author, version, about = "Authoritative IP blacklist with firewall reconciliation agents")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    pub config: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the authority: HTTP API plus the feed import scheduler
    Serve {
        /// Listen address (overrides config)
        #[arg(long)]
        listen: Option<String>,

        /// Do not start the import scheduler
        #[arg(long)]
        no_feeds: bool,
    },

    /// Run the enforcement agent loop on this host
    Agent,

    /// Run a single reconciliation cycle
    Sync {
        /// Fetch and diff, print the changes, touch nothing
        #[arg(long)]
        dry_run: bool,
    },

    /// Import addresses into the local store
    Import {
        /// Target list (blacklist, whitelist)
        list: ListKind,

        /// Addresses or CIDR ranges
        ips: Vec<String>,

        /// Read additional addresses from a file (one per line)
        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long, default_value = "cli")]
        source: String,

        #[arg(long)]
        reason: Option<String>,

        #[arg(long)]
        comment: Option<String>,
    },

    /// Print an export of the local store
    Export {
        #[arg(value_enum)]
        view: ExportTarget,

        /// Output format for list views (json, csv)
        #[arg(long, default_value = "json")]
        format: String,

        /// Directive dialect for rules (iptables, ipfw, nftables)
        #[arg(long, default_value = "iptables")]
        dialect: String,

        /// Only entries from this source
        #[arg(long)]
        source: Option<String>,
    },

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show version
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportTarget {
    /// Effective blacklist (whitelist applied)
    Blacklist,
    Whitelist,
    /// Firewall directives for the effective blacklist
    Rules,
}
