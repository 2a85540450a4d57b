//! Import post-processors selected and ordered by an [`ImportConfig`].
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::model::{ImportConfig, RawRecord, DEFAULT_POLICY};

/// Records about to be handed to the importer, plus run-level state the
/// processors may read or adjust.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportBatch {
    pub records: Vec<RawRecord>,
    /// Tag written to every import status row of this run.
    pub policy: String,
    /// Previous import time per UUID.
    pub last_imports: HashMap<String, i64>,
}

impl ImportBatch {
    pub fn new(records: Vec<RawRecord>, last_imports: HashMap<String, i64>) -> Self {
        Self {
            records,
            policy: DEFAULT_POLICY.to_string(),
            last_imports,
        }
    }
}

pub trait ImportProcessor: Send + Sync {
    fn id(&self) -> &'static str;
    fn process(&self, batch: &mut ImportBatch, settings: &Value) -> Result<()>;
}

#[derive(Deserialize, Default)]
struct DefaultDataSettings {
    #[serde(default)]
    policy: Option<String>,
}

/// Stamps the configured policy tag.
pub struct DefaultDataProcessor;

impl ImportProcessor for DefaultDataProcessor {
    fn id(&self) -> &'static str {
        "default_data_processor"
    }

    fn process(&self, batch: &mut ImportBatch, settings: &Value) -> Result<()> {
        let s: DefaultDataSettings = if settings.is_null() {
            DefaultDataSettings::default()
        } else {
            serde_json::from_value(settings.clone()).context("invalid default_data_processor settings")?
        };
        if let Some(policy) = s.policy.filter(|p| !p.trim().is_empty()) {
            batch.policy = policy;
        }
        Ok(())
    }
}

/// Drops records unchanged since their last import.
pub struct SkipImported;

impl ImportProcessor for SkipImported {
    fn id(&self) -> &'static str {
        "skip_imported"
    }

    fn process(&self, batch: &mut ImportBatch, _settings: &Value) -> Result<()> {
        let before = batch.records.len();
        let last_imports = &batch.last_imports;
        batch.records.retain(|record| {
            match (record.changed_timestamp(), last_imports.get(&record.id)) {
                (Some(changed), Some(last)) => changed > *last,
                _ => true,
            }
        });
        debug!(
            skipped = before - batch.records.len(),
            "skipped records unchanged since last import"
        );
        Ok(())
    }
}

#[derive(Deserialize)]
struct ExcludeFieldsSettings {
    #[serde(default)]
    fields: Vec<String>,
}

/// Removes attributes and relationships by public name.
pub struct ExcludeFields;

impl ImportProcessor for ExcludeFields {
    fn id(&self) -> &'static str {
        "exclude_fields"
    }

    fn process(&self, batch: &mut ImportBatch, settings: &Value) -> Result<()> {
        let s: ExcludeFieldsSettings =
            serde_json::from_value(settings.clone()).context("invalid exclude_fields settings")?;
        for record in &mut batch.records {
            for field in &s.fields {
                record.attributes.remove(field);
                record.relationships.remove(field);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: BTreeMap<String, Arc<dyn ImportProcessor>>,
}

impl ProcessorRegistry {
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(DefaultDataProcessor));
        registry.register(Arc::new(SkipImported));
        registry.register(Arc::new(ExcludeFields));
        registry
    }

    pub fn register(&mut self, processor: Arc<dyn ImportProcessor>) {
        self.processors.insert(processor.id().to_string(), processor);
    }

    /// Enabled processors in ascending weight, ties by id.
    pub fn chain(&self, config: &ImportConfig) -> Vec<(Arc<dyn ImportProcessor>, Value)> {
        let mut selected: Vec<_> = config
            .processors
            .iter()
            .filter_map(|(id, s)| match self.processors.get(id) {
                Some(p) => Some((s.weight, id.as_str(), p.clone(), s.settings.clone())),
                None => {
                    warn!(processor = %id, import_config = %config.id, "unknown import processor; skipping");
                    None
                }
            })
            .collect();
        selected.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        selected.into_iter().map(|(_, _, p, s)| (p, s)).collect()
    }

    pub fn run(&self, config: &ImportConfig, batch: &mut ImportBatch) -> Result<()> {
        for (processor, settings) in self.chain(config) {
            processor
                .process(batch, &settings)
                .with_context(|| format!("import processor {} failed", processor.id()))?;
        }
        Ok(())
    }
}
