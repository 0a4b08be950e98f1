//! Bounty Escrow Server
//!
//! Escrows bounty rewards and staked security behind a signed HTTP API

use std::sync::Arc;

use bounty_escrow::config::Config;
use bounty_escrow::service::{EscrowService, SystemClock};
use bounty_escrow::storage::LedgerStore;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "escrow-server", version, about = "Bounty escrow ledger server")]
struct Args {
    /// Path to config.toml (embedded defaults if missing)
    #[arg(short, long, env = "ESCROW_CONFIG", default_value = "config.toml")]
    config: String,

    /// Override [server] host
    #[arg(long, env = "ESCROW_HOST")]
    host: Option<String>,

    /// Override [server] port
    #[arg(short, long, env = "ESCROW_PORT")]
    port: Option<u16>,

    /// Override [storage] path
    #[arg(long, env = "ESCROW_DB")]
    db: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load_from(&args.config)?;

    info!("Starting Bounty Escrow Server");

    let db_path = args.db.unwrap_or_else(|| config.storage.path.clone());
    let store = LedgerStore::open(&db_path)?;
    info!("Ledger database at {}", db_path);

    let service = Arc::new(EscrowService::bootstrap(&config, store, Arc::new(SystemClock))?);
    info!(
        "Ledger ready: {} bounties, custody {}",
        service.bounty_count(),
        config.custody_account()
    );

    let host = args.host.unwrap_or_else(|| config.server.host.clone());
    let port = args.port.unwrap_or(config.server.port);

    bounty_escrow::server::run_server(&host, port, service).await?;

    Ok(())
}
