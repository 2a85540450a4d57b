//! Pulls a channel from a remote and persists what passes the subscription's
//! operation gates and the import config's processors.
//!
//! A run walks `FetchingPage -> Accumulating` until the collection has no
//! next link or the pair's page budget is spent, then filters, persists and
//! records import status. When it stops early the cursor is queued as a
//! work item so a later run resumes there.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, Instrument};

use crate::config::Config;
use crate::db::{self, Pool};
use crate::model::{
    EntityImportStatus, ImportContext, OperationPolicy, PendingSyncWorkItem, RawRecord,
};
use crate::remote::{self, PageFetcher};
use crate::settings::{PairKey, SettingsChain};

pub mod processor;

use processor::{ImportBatch, ProcessorRegistry};

/// Identity of an entity after the importer wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedEntity {
    pub entity_id: String,
    pub uuid: String,
    pub entity_type_id: String,
    pub bundle: String,
}

/// Writes records into local storage.
#[async_trait]
pub trait RecordImporter: Send + Sync {
    async fn import_records(&self, records: &[RawRecord]) -> Result<Vec<ImportedEntity>>;
}

/// Answers which UUIDs already exist locally.
#[async_trait]
pub trait EntityLookup: Send + Sync {
    async fn existing_uuids(
        &self,
        entity_type_id: &str,
        uuids: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>>;
}

/// What one run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub pages: u32,
    pub fetched: usize,
    pub imported: usize,
    /// Cursor queued for the next run, if the budget stopped this one.
    pub continuation: Option<String>,
}

/// Drop records the pair may not create or update.
pub async fn filter_by_operations(
    records: Vec<RawRecord>,
    operations: &OperationPolicy,
    lookup: &dyn EntityLookup,
) -> Result<Vec<RawRecord>> {
    if operations.create && operations.update {
        return Ok(records);
    }
    if !operations.create && !operations.update {
        return Ok(Vec::new());
    }

    let mut by_type: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for record in &records {
        by_type
            .entry(record.entity_type().to_string())
            .or_default()
            .insert(record.id.clone());
    }
    let mut existing: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (entity_type, uuids) in &by_type {
        existing.insert(
            entity_type.clone(),
            lookup.existing_uuids(entity_type, uuids).await?,
        );
    }

    Ok(records
        .into_iter()
        .filter(|record| {
            let exists = existing
                .get(record.entity_type())
                .map(|set| set.contains(&record.id))
                .unwrap_or(false);
            if exists {
                operations.update
            } else {
                operations.create
            }
        })
        .collect())
}

#[derive(Clone)]
pub struct SyncService {
    pool: Pool,
    config: Arc<Config>,
    settings: Arc<SettingsChain>,
    fetcher: Arc<dyn PageFetcher>,
    importer: Arc<dyn RecordImporter>,
    lookup: Arc<dyn EntityLookup>,
    processors: ProcessorRegistry,
}

impl SyncService {
    pub fn new(
        pool: Pool,
        config: Arc<Config>,
        fetcher: Arc<dyn PageFetcher>,
        importer: Arc<dyn RecordImporter>,
        lookup: Arc<dyn EntityLookup>,
    ) -> Self {
        let settings = Arc::new(SettingsChain::from_config(&config));
        Self {
            pool,
            config,
            settings,
            fetcher,
            importer,
            lookup,
            processors: ProcessorRegistry::with_builtin(),
        }
    }

    pub fn with_settings(mut self, settings: SettingsChain) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn with_processors(mut self, processors: ProcessorRegistry) -> Self {
        self.processors = processors;
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn context_for(&self, remote_id: &str, channel_id: &str, url: Option<&str>) -> ImportContext {
        ImportContext {
            remote_id: remote_id.to_string(),
            channel_id: channel_id.to_string(),
            import_config_id: self.settings.import_config(&PairKey::new(remote_id, channel_id)),
            channel_url: url.map(str::to_string),
        }
    }

    /// Run a pair from `resume_url`, or from the channel root when `None`.
    pub async fn sync(
        &self,
        remote_id: &str,
        channel_id: &str,
        resume_url: Option<&str>,
    ) -> Result<RunReport> {
        let ctx = self.context_for(remote_id, channel_id, resume_url);
        self.run(&ctx, None).await
    }

    /// Resume from a queued work item; the item is removed only on success.
    pub async fn run_work_item(&self, item: &PendingSyncWorkItem) -> Result<RunReport> {
        let ctx = self.context_for(&item.remote_id, &item.channel_id, item.url.as_deref());
        self.run(&ctx, Some(item.id)).await
    }

    async fn run(&self, ctx: &ImportContext, claimed: Option<i64>) -> Result<RunReport> {
        let run_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!(
            "sync_run",
            %run_id,
            remote = %ctx.remote_id,
            channel = %ctx.channel_id,
        );
        self.run_inner(ctx, claimed).instrument(span).await
    }

    async fn run_inner(&self, ctx: &ImportContext, claimed: Option<i64>) -> Result<RunReport> {
        let remote = self
            .config
            .remote(&ctx.remote_id)
            .ok_or_else(|| anyhow!("unknown remote: {}", ctx.remote_id))?;
        let channel = self
            .config
            .channel(&ctx.channel_id)
            .ok_or_else(|| anyhow!("unknown channel: {}", ctx.channel_id))?;
        let operations = self
            .config
            .subscriptions
            .iter()
            .find(|s| s.remote == ctx.remote_id && s.channel == ctx.channel_id)
            .map(|s| s.operations)
            .unwrap_or_default();
        let import_config = self.config.import_config(&ctx.import_config_id);
        let budget = self
            .settings
            .page_budget(&PairKey::new(&ctx.remote_id, &ctx.channel_id));

        let mut url = match &ctx.channel_url {
            Some(url) => url.clone(),
            None => remote::channel_root_url(
                remote,
                channel,
                &self.config.entity_types,
                import_config.max_size,
            )?,
        };

        let mut report = RunReport::default();
        let mut records = Vec::new();
        loop {
            debug!(%url, "fetching page");
            let page = self
                .fetcher
                .fetch_page(remote, &url)
                .await
                .with_context(|| format!("fetching {url}"))?;
            report.pages += 1;
            records.extend(page.records);
            match page.next_url {
                None => break,
                Some(next) if budget != 0 && report.pages >= budget => {
                    report.continuation = Some(next);
                    break;
                }
                Some(next) => url = next,
            }
        }
        report.fetched = records.len();

        let records = filter_by_operations(records, &operations, self.lookup.as_ref()).await?;
        let uuids: BTreeSet<String> = records.iter().map(|r| r.id.clone()).collect();
        let last_imports = db::last_import_times(&self.pool, &uuids).await?;
        let mut batch = ImportBatch::new(records, last_imports);
        self.processors.run(&import_config, &mut batch)?;

        let imported = self.importer.import_records(&batch.records).await?;
        self.record_status(ctx, &imported, &batch.policy).await?;
        report.imported = imported.len();

        db::complete_pending_sync(
            &self.pool,
            claimed,
            &ctx.remote_id,
            &ctx.channel_id,
            report.continuation.as_deref(),
        )
        .await?;

        info!(
            pages = report.pages,
            fetched = report.fetched,
            imported = report.imported,
            continuing = report.continuation.is_some(),
            "sync run finished"
        );
        Ok(report)
    }

    #[instrument(skip_all)]
    async fn record_status(
        &self,
        ctx: &ImportContext,
        imported: &[ImportedEntity],
        policy: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        for entity in imported {
            db::upsert_import_status(
                &self.pool,
                &EntityImportStatus {
                    entity_id: entity.entity_id.clone(),
                    entity_uuid: entity.uuid.clone(),
                    entity_type_id: entity.entity_type_id.clone(),
                    entity_bundle: entity.bundle.clone(),
                    remote_website_id: ctx.remote_id.clone(),
                    channel_id: ctx.channel_id.clone(),
                    last_import: now,
                    policy: policy.to_string(),
                },
            )
            .await?;
        }
        Ok(())
    }
}
