//! Operator preview: what importing a remote record would change locally.
use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, instrument};

use super::entity::ContentEntity;
use super::{DiffEngine, EntitySource, MemorySource, ParsedEntity};
use crate::model::RawRecord;
use crate::store::SqliteEntityStore;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ChangeKind {
    /// Only on the remote side.
    Added,
    /// Only on the local side.
    Removed,
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FieldChange {
    pub label: String,
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub uuid: String,
    pub local: Option<ParsedEntity>,
    pub remote: ParsedEntity,
    pub changes: Vec<FieldChange>,
}

/// Changes in remote label order, then labels only present locally.
pub fn compare(local: &ParsedEntity, remote: &ParsedEntity) -> Vec<FieldChange> {
    let mut changes: Vec<FieldChange> = remote
        .iter()
        .map(|(label, remote_value)| {
            let local_value = local.get(label);
            let kind = match local_value {
                None => ChangeKind::Added,
                Some(v) if v == remote_value => ChangeKind::Unchanged,
                Some(_) => ChangeKind::Changed,
            };
            FieldChange {
                label: label.clone(),
                kind,
                local: local_value.cloned(),
                remote: Some(remote_value.clone()),
            }
        })
        .collect();
    changes.extend(
        local
            .iter()
            .filter(|(label, _)| !remote.contains_key(*label))
            .map(|(label, value)| FieldChange {
                label: label.clone(),
                kind: ChangeKind::Removed,
                local: Some(value.clone()),
                remote: None,
            }),
    );
    changes
}

/// Parse `record` (with its side-loaded `included` resources) against the
/// stored copy and everything the stored copy references. Referenced
/// records the remote did not side-load are read from their stored copy on
/// both sides, so they never show up as changes.
#[instrument(skip_all, fields(uuid = %record.id))]
pub async fn preview(
    store: &SqliteEntityStore,
    engine: &DiffEngine,
    record: &RawRecord,
    included: &[RawRecord],
    language: Option<&str>,
) -> Result<Preview> {
    let mut source = MemorySource::default();
    source.insert_remote(record.clone());
    for resource in included {
        source.insert_remote(resource.clone());
    }

    let remote_entity =
        ContentEntity::from_record(record, &engine.definition(record.entity_type()));
    // Targets only the remote side references may still be stored locally.
    let mut queue = VecDeque::from([record.id.clone()]);
    queue.extend(remote_entity.reference_targets());
    let mut seen = HashSet::new();
    while let Some(uuid) = queue.pop_front() {
        if !seen.insert(uuid.clone()) {
            continue;
        }
        let records = store.load_records(&uuid).await?;
        let Some(first) = records.first() else {
            continue;
        };
        let definition = engine.definition(first.entity_type());
        let Some(entity) = ContentEntity::from_records(&records, &definition) else {
            continue;
        };
        queue.extend(entity.reference_targets());
        source.insert_local(entity);
        if uuid != record.id && source.remote(&uuid).is_none() {
            debug!(uuid = %uuid, "not side-loaded; using stored copy");
            source.insert_remote(first.clone());
        }
    }

    let remote = engine.parse(&remote_entity, Some(record), language, &source);
    let local = source
        .local(&record.id)
        .map(|entity| engine.parse(entity, None, language, &source));
    let changes = compare(local.as_ref().unwrap_or(&ParsedEntity::new()), &remote);
    Ok(Preview {
        uuid: record.id.clone(),
        local,
        remote,
        changes,
    })
}
