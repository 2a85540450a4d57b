use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use channel_sync::config;
use channel_sync::db;
use channel_sync::import::SyncService;
use channel_sync::remote::auth::AuthorizationRegistry;
use channel_sync::remote::HttpPageFetcher;
use channel_sync::scheduler;
use channel_sync::store::SqliteEntityStore;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single scheduler tick and exit
    #[arg(long)]
    once: bool,
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
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let max_backoff = cfg.app.max_backoff_seconds as i64;
    let store = Arc::new(SqliteEntityStore::new(pool.clone()));
    let fetcher = Arc::new(HttpPageFetcher::new(Arc::new(
        AuthorizationRegistry::with_builtin(),
    )));
    let service = SyncService::new(pool, Arc::new(cfg), fetcher, store.clone(), store);

    info!(once = args.once, "starting channel sync scheduler");
    loop {
        match scheduler::drain(&service, max_backoff).await {
            Ok(tick) => info!(
                started = tick.started,
                resumed = tick.resumed,
                waiting = tick.waiting,
                failed = tick.failed,
                "tick finished"
            ),
            Err(err) => error!(?err, "scheduler tick error"),
        }
        if args.once {
            break;
        }
        tokio::time::sleep(poll_sleep).await;
    }
    Ok(())
}
