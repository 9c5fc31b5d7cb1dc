use clap::Parser;
use gridlands_server::config::ServerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "gridlands-server", about = "Grid world game server")]
struct Args {
    /// YAML config file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address.
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// SQLite database path.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Seconds between regeneration sweep cycles.
    #[arg(long)]
    sweep_interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut cfg = ServerConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        cfg.addr = addr;
    }
    if let Some(db) = args.db {
        cfg.db_path = db;
    }
    if let Some(secs) = args.sweep_interval_secs {
        cfg.sweep_interval_secs = secs;
    }

    gridlands_server::serve(
        cfg.addr,
        cfg.db_path,
        Duration::from_secs(cfg.sweep_interval_secs.max(1)),
    )
    .await
}
