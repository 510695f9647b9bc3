//! Blue Karaoke authority server
//!
//! Serves activation key validation, the catalog, media blobs and history
//! ingestion to nodes, plus operator subcommands for managing keys and songs.

#![allow(clippy::print_stdout)]

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use karaoke_authority::routes::{AppState, build_router};
use karaoke_authority::storage::{AuthorityDatabase, NewCatalogEntry};
use karaoke_core::catalog::CatalogCode;
use karaoke_core::clock;
use karaoke_core::db::unix_timestamp;
use karaoke_core::license::{KeyKind, LicenseKey, saturating_expiry};

#[derive(Parser, Debug)]
#[command(name = "karaoke-authority")]
#[command(version, about = "Blue Karaoke authority - keys, catalog and history")]
struct Args {
    /// Database file path
    #[arg(long, env = "KARAOKE_AUTHORITY_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "KARAOKE_AUTHORITY_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "KARAOKE_AUTHORITY_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server.
    Serve {
        /// TCP bind address
        #[arg(long, default_value = "0.0.0.0:8080", env = "KARAOKE_AUTHORITY_ADDR")]
        addr: SocketAddr,

        /// Directory served under `/media`
        #[arg(long, env = "KARAOKE_AUTHORITY_MEDIA_DIR")]
        media_dir: PathBuf,
    },
    /// Issue a new activation key and print it.
    IssueKey {
        #[arg(long, value_enum)]
        kind: KindArg,

        /// Machine keys: days of use counted from first activation.
        #[arg(long, required_if_eq("kind", "machine"))]
        days: Option<i64>,

        /// Subscription keys: days from now until expiry (omit for no expiry).
        #[arg(long)]
        expires_in_days: Option<i64>,

        /// Use this key text instead of generating one.
        #[arg(long)]
        key: Option<String>,
    },
    /// Clear a key's device binding so another machine can use it.
    Unbind { key: String },
    /// Revoke a key permanently.
    Revoke { key: String },
    /// List issued keys.
    ListKeys,
    /// Publish or update a catalog entry.
    AddSong {
        #[arg(long)]
        codigo: String,
        #[arg(long)]
        artista: String,
        #[arg(long)]
        titulo: String,
        /// Blob reference; defaults to `media/<codigo>.mp4`.
        #[arg(long)]
        media_ref: Option<String>,
        #[arg(long)]
        size: Option<i64>,
        #[arg(long)]
        duration: Option<i64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Subscription,
    Machine,
}

impl From<KindArg> for KeyKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Subscription => Self::Subscription,
            KindArg::Machine => Self::Machine,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    karaoke_core::tracing_init::init_tracing(
        &karaoke_core::tracing_init::default_filter("karaoke_authority", &args.log_level),
        args.log_json,
    );

    let db_path = match &args.db_path {
        Some(path) => path.clone(),
        None => default_db_path()?,
    };
    let db = AuthorityDatabase::open(&db_path).await?;

    match args.command {
        Command::Serve { addr, media_dir } => serve(db, addr, media_dir).await,
        Command::IssueKey {
            kind,
            days,
            expires_in_days,
            key,
        } => {
            let key = match key {
                Some(text) => LicenseKey::parse(&text)?,
                None => LicenseKey::generate(),
            };
            let kind = KeyKind::from(kind);
            let (budget, expires_at) = match kind {
                KeyKind::Machine => (days, None),
                KeyKind::Subscription => (
                    None,
                    expires_in_days.map(|d| saturating_expiry(unix_timestamp(), d)),
                ),
            };
            db.insert_key(&key, kind, budget, expires_at).await?;
            info!(key = %key.redacted(), %kind, "Activation key issued");
            println!("{key}");
            Ok(())
        }
        Command::Unbind { key } => {
            let key = LicenseKey::parse(&key)?;
            anyhow::ensure!(db.unbind_key(key.as_str()).await?, "unknown key {key}");
            println!("unbound {key}");
            Ok(())
        }
        Command::Revoke { key } => {
            let key = LicenseKey::parse(&key)?;
            anyhow::ensure!(db.revoke_key(key.as_str()).await?, "unknown key {key}");
            println!("revoked {key}");
            Ok(())
        }
        Command::ListKeys => {
            for row in db.list_keys().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    row.key,
                    row.kind,
                    row.status,
                    row.bound_device_id.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Command::AddSong {
            codigo,
            artista,
            titulo,
            media_ref,
            size,
            duration,
        } => {
            let codigo = CatalogCode::parse(&codigo)?;
            let media_ref = media_ref.unwrap_or_else(|| format!("media/{}", codigo.file_name("mp4")));
            let row = db
                .upsert_catalog_entry(&NewCatalogEntry {
                    codigo: &codigo,
                    artista: &artista,
                    titulo: &titulo,
                    media_ref: &media_ref,
                    size,
                    duration,
                })
                .await?;
            println!("{} revision {}", row.codigo, row.revision);
            Ok(())
        }
    }
}

async fn serve(db: AuthorityDatabase, addr: SocketAddr, media_dir: PathBuf) -> anyhow::Result<()> {
    let app = build_router(AppState {
        db,
        clock: clock::system(),
        media_dir: media_dir.clone(),
    });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        %addr,
        media_dir = %media_dir.display(),
        "Starting karaoke-authority"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Authority stopped");
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

/// Default database path: `<data dir>/karaoke/authority.db`
fn default_db_path() -> anyhow::Result<PathBuf> {
    let data = dirs::data_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine data directory"))?;
    Ok(data.join("karaoke").join("authority.db"))
}
