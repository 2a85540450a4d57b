use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use channel_sync::config;
use channel_sync::db;
use channel_sync::scheduler;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Queue a sync run for a remote/channel pair; the daemon picks it up on its next tick"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Remote id
    #[arg(long)]
    remote: String,

    /// Channel id
    #[arg(long)]
    channel: String,

    /// Page URL to resume from; omitted means the channel root
    #[arg(long)]
    url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    if cfg.remote(&args.remote).is_none() {
        bail!("unknown remote: {}", args.remote);
    }
    if cfg.channel(&args.channel).is_none() {
        bail!("unknown channel: {}", args.channel);
    }
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let id = scheduler::enqueue(&pool, &args.remote, &args.channel, args.url.as_deref()).await?;
    let pending = db::count_pending_sync(&pool).await?;
    info!(id, pending, "queued");
    println!("{id}");
    Ok(())
}
