//! Local entity storage backed by the `imported_entities` table.
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::instrument;

use crate::db::{self, Pool};
use crate::import::{EntityLookup, ImportedEntity, RecordImporter};
use crate::model::{RawRecord, LANGCODE_NOT_SPECIFIED};

#[derive(Debug, Clone)]
pub struct SqliteEntityStore {
    pool: Pool,
}

impl SqliteEntityStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Stored translations of `uuid` as raw records, default translation first.
    pub async fn load_records(&self, uuid: &str) -> Result<Vec<RawRecord>> {
        let rows = db::fetch_entity_rows(&self.pool, uuid).await?;
        rows.iter()
            .map(|row| {
                serde_json::from_str(&row.payload)
                    .with_context(|| format!("corrupt stored payload for {}", row.uuid))
            })
            .collect()
    }
}

#[async_trait]
impl RecordImporter for SqliteEntityStore {
    #[instrument(skip_all, fields(count = records.len()))]
    async fn import_records(&self, records: &[RawRecord]) -> Result<Vec<ImportedEntity>> {
        let mut imported: Vec<ImportedEntity> = Vec::with_capacity(records.len());
        for record in records {
            let payload = serde_json::to_string(record)?;
            let langcode = record.langcode().unwrap_or(LANGCODE_NOT_SPECIFIED);
            let id = db::upsert_entity(
                &self.pool,
                &record.id,
                langcode,
                record.entity_type(),
                record.bundle(),
                &payload,
            )
            .await?;
            // One status row per entity, however many translations arrived.
            if imported.iter().any(|e| e.uuid == record.id) {
                continue;
            }
            imported.push(ImportedEntity {
                entity_id: id.to_string(),
                uuid: record.id.clone(),
                entity_type_id: record.entity_type().to_string(),
                bundle: record.bundle().to_string(),
            });
        }
        Ok(imported)
    }
}

#[async_trait]
impl EntityLookup for SqliteEntityStore {
    async fn existing_uuids(
        &self,
        entity_type_id: &str,
        uuids: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        db::existing_uuids(&self.pool, entity_type_id, uuids).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteEntityStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::run_migrations(&pool).await.unwrap();
        SqliteEntityStore::new(pool)
    }

    fn record(id: &str, langcode: &str, title: &str) -> RawRecord {
        serde_json::from_value(json!({
            "type": "node--article",
            "id": id,
            "attributes": { "langcode": langcode, "title": title }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn translations_share_one_entity() {
        let store = store().await;
        let imported = store
            .import_records(&[record("a", "en", "Hello"), record("a", "fr", "Bonjour")])
            .await
            .unwrap();
        assert_eq!(imported.len(), 1);

        let records = store.load_records("a").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].attributes["title"], "Hello");
        assert_eq!(records[1].attributes["title"], "Bonjour");
    }

    #[tokio::test]
    async fn reimport_replaces_payload() {
        let store = store().await;
        store.import_records(&[record("a", "en", "v1")]).await.unwrap();
        let second = store.import_records(&[record("a", "en", "v2")]).await.unwrap();
        let first_id = second[0].entity_id.clone();
        let again = store.import_records(&[record("a", "en", "v2")]).await.unwrap();
        assert_eq!(again[0].entity_id, first_id);
        assert_eq!(store.load_records("a").await.unwrap()[0].attributes["title"], "v2");
    }

    #[tokio::test]
    async fn lookup_filters_by_type() {
        let store = store().await;
        store.import_records(&[record("a", "en", "x")]).await.unwrap();
        let asked = BTreeSet::from(["a".to_string(), "b".to_string()]);
        assert_eq!(
            store.existing_uuids("node", &asked).await.unwrap(),
            BTreeSet::from(["a".to_string()])
        );
        assert!(store
            .existing_uuids("taxonomy_term", &asked)
            .await
            .unwrap()
            .is_empty());
    }
}
