//! blocksync - authoritative IP blacklist with firewall reconciliation agents

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use blocksync::cli::{Cli, Commands};
use blocksync::commands;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flags when set
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let log_level = if cli.verbose {
            Level::DEBUG
        } else if cli.quiet {
            Level::ERROR
        } else {
            Level::INFO
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_target(false)
            .with_thread_ids(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    match cli.command {
        Commands::Serve { listen, no_feeds } => commands::serve::run(listen, no_feeds, &cli.config).await,
        Commands::Agent => commands::agent::run(&cli.config).await,
        Commands::Sync { dry_run } => commands::sync::run(dry_run, &cli.config).await,
        Commands::Import {
            list,
            ips,
            file,
            source,
            reason,
            comment,
        } => {
            let args = commands::import::ImportArgs {
                list,
                ips,
                file,
                source,
                reason,
                comment,
            };
            commands::import::run(args, &cli.config).await
        }
        Commands::Export {
            view,
            format,
            dialect,
            source,
        } => commands::export::run(view, &format, &dialect, source, &cli.config).await,
        Commands::Init { force } => commands::init::run(force, &cli.config).await,
        Commands::Version => {
            println!("blocksync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
