use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use channel_sync::config;
use channel_sync::db;
use channel_sync::diff::preview::preview;
use channel_sync::diff::DiffEngine;
use channel_sync::remote::auth::AuthorizationRegistry;
use channel_sync::remote::decode_page;
use channel_sync::store::SqliteEntityStore;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Fetch one remote record and print its field-level diff against the local copy"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[arg(long)]
    remote: String,

    #[arg(long)]
    channel: String,

    /// UUID of the record
    #[arg(long)]
    uuid: String,

    /// Compare this translation instead of the default one
    #[arg(long)]
    language: Option<String>,

    /// Extra relationship paths to side-load, on top of the reference fields
    /// the schema declares (repeatable, e.g. field_sections.field_media)
    #[arg(long)]
    include: Vec<String>,
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
    let remote = cfg
        .remote(&args.remote)
        .ok_or_else(|| anyhow!("unknown remote: {}", args.remote))?;
    let channel = cfg
        .channel(&args.channel)
        .ok_or_else(|| anyhow!("unknown channel: {}", args.channel))?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let engine = DiffEngine::new(cfg.entity_types.clone());
    let mut include = engine.include_paths(&channel.entity_type);
    for path in args.include {
        if !include.contains(&path) {
            include.push(path);
        }
    }
    let url = remote.record_url(&channel.entity_type, &channel.bundle, &args.uuid, &include)?;
    let registry = AuthorizationRegistry::with_builtin();
    let response = remote.client(&registry)?.get(url.as_str()).await?;
    let page = decode_page(&response.body).with_context(|| format!("unexpected body from {url}"))?;
    let record = page
        .records
        .first()
        .ok_or_else(|| anyhow!("remote returned no record for {}", args.uuid))?;

    let store = SqliteEntityStore::new(pool);
    let result = preview(
        &store,
        &engine,
        record,
        &page.included,
        args.language.as_deref(),
    )
    .await?;
    info!(
        uuid = %result.uuid,
        local = result.local.is_some(),
        changes = result.changes.len(),
        "preview ready"
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
