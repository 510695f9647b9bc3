//! Blue Karaoke node daemon
//!
//! Checks the local lease, mirrors the catalog, relays play history and
//! serves the local API the front-end talks to.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use karaoke_core::clock;
use karaoke_core::config::{self, Config};
use karaoke_node::Node;
use karaoke_node::remote::HttpRemote;
use karaoke_node::server::build_router;
use karaoke_node::storage::LocalStore;

#[derive(Parser, Debug)]
#[command(name = "karaoke-node")]
#[command(version, about = "Blue Karaoke node - offline license, catalog sync, play history")]
struct Args {
    /// Settings file (defaults to the platform config dir)
    #[arg(long, env = "KARAOKE_CONFIG")]
    config: Option<PathBuf>,

    /// Authority base URL
    #[arg(long)]
    authority_url: Option<String>,

    /// Local API bind address
    #[arg(long)]
    listen: Option<String>,

    /// State directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory media files are stored in
    #[arg(long)]
    media_root: Option<PathBuf>,

    /// Database file path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Override the persisted device fingerprint
    #[arg(long)]
    device_id: Option<String>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "KARAOKE_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// CLI flags win over settings file and environment.
    fn apply(self, config: &mut Config) {
        let node = &mut config.node;
        if let Some(v) = self.authority_url {
            node.authority_url = v;
        }
        if let Some(v) = self.listen {
            node.listen = v;
        }
        if self.data_dir.is_some() {
            node.data_dir = self.data_dir;
        }
        if self.media_root.is_some() {
            node.media_root = self.media_root;
        }
        if self.db_path.is_some() {
            node.db_path = self.db_path;
        }
        if self.device_id.is_some() {
            node.device_id = self.device_id;
        }
        if let Some(v) = self.log_level {
            node.log_level = v;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let log_json = args.log_json;

    let settings = args.config.clone().or_else(config::global_config_path);
    let mut config = config::load_config_from(settings.as_deref(), |name| std::env::var(name).ok())?;
    args.apply(&mut config);

    karaoke_core::tracing_init::init_tracing(
        &karaoke_core::tracing_init::default_filter("karaoke_node", &config.node.log_level),
        log_json,
    );

    let db_path = config.db_path()?;
    let media_root = config.media_root()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        authority = %config.node.authority_url,
        listen = %config.node.listen,
        db = %db_path.display(),
        media_root = %media_root.display(),
        "Starting karaoke-node"
    );

    let store = LocalStore::open(&db_path).await?;
    let device_id = match &config.node.device_id {
        Some(id) => id.clone(),
        None => store.device_id().await?,
    };
    let remote = Arc::new(HttpRemote::new(&config.node.authority_url)?);
    let node = Node::new(
        config.clone(),
        store,
        remote,
        clock::system(),
        device_id,
        media_root,
    );

    // Boot: fast local check now, revalidation runs in the background.
    let lease = node.license.get_local_lease().await;
    if lease.ativada {
        info!(dias_restantes = ?lease.dias_restantes, "Local lease is active");
    } else {
        warn!("No active lease; activation required");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let tasks = node.spawn_background(&shutdown_rx);

    let listener = tokio::net::TcpListener::bind(&config.node.listen).await?;
    info!(addr = %listener.local_addr()?, "Local API listening");

    axum::serve(listener, build_router(node.app_state()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    info!("Node stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
        () = sigterm => info!("Received SIGTERM shutdown signal"),
    }
}
