//! Serve command: the authority process.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::api::{self, AppState};
use crate::feeds::{build_feeds, default_client};
use crate::scheduler::ImportScheduler;
use crate::signal::{ShutdownGuard, ShutdownToken};

use super::{load_config, open_service};

/// Run the HTTP API and, unless disabled, the import scheduler until SIGINT/SIGTERM.
pub async fn run(listen: Option<String>, no_feeds: bool, config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let addr: SocketAddr = match listen {
        Some(listen) => listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", listen))?,
        None => config.authority.listen_addr()?,
    };

    let service = open_service(&config)?;
    info!(
        "Store {} opened with max expansion {}",
        config.authority.database_path.display(),
        config.authority.max_expansion
    );

    let client = default_client()?;
    let api_feeds = build_feeds(&config.authority, &client)?;
    let shutdown = ShutdownToken::new();
    let _signals = ShutdownGuard::new(shutdown.clone());

    let scheduler_task = if no_feeds {
        info!("Feed import scheduler disabled");
        None
    } else {
        let scheduler = ImportScheduler::new(
            build_feeds(&config.authority, &client)?,
            service.clone(),
            config.authority.import_interval()?,
        );
        let token = shutdown.clone();
        Some(tokio::spawn(async move { scheduler.run(token).await }))
    };

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let state = AppState::new(service, api_feeds, config.agent.ipfw_table);
    let served = api::serve(listener, state, shutdown.clone()).await;

    // Server may have failed on its own; stop the scheduler either way
    shutdown.cancel();
    if let Some(task) = scheduler_task {
        if let Err(e) = task.await {
            error!("Import scheduler task failed: {}", e);
        }
    }
    served
}
