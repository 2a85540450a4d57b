//! Field-level diff engine.
//!
//! [`DiffEngine::parse`] turns a local entity, or a remote record, into a map
//! keyed by field label so both sides can be compared by an operator. Each
//! parse call owns its visited set, so cyclic composed content is expanded
//! at most once per side.
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::model::RawRecord;
use crate::schema::{EntityTypeDefinition, FieldDefinition, Schema};

pub mod comparator;
pub mod entity;
pub mod preview;

use comparator::{ComparatorRegistry, FieldInput};
use entity::{normalize_relationship, ContentEntity};

/// Label-keyed parse result in field declaration order.
pub type ParsedEntity = Map<String, Value>;

const AUDIT_FIELDS: &[&str] = &["changed", "created"];
const TRANSLATION_FIELDS: &[&str] = &[
    "content_translation_source",
    "content_translation_outdated",
    "content_translation_uid",
    "content_translation_status",
    "content_translation_created",
    "content_translation_changed",
];
const HIERARCHY_FIELDS: &[&str] = &["parent_id", "parent_type", "parent_field_name"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Reference whose target can be resolved from the wire payload.
    Handleable,
    NotHandleable,
    Plain,
}

/// Where the engine looks up referenced entities.
pub trait EntitySource {
    fn local(&self, uuid: &str) -> Option<&ContentEntity>;
    fn remote(&self, uuid: &str) -> Option<&RawRecord>;
}

#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    local: HashMap<String, ContentEntity>,
    remote: HashMap<String, RawRecord>,
}

impl MemorySource {
    pub fn insert_local(&mut self, entity: ContentEntity) {
        self.local.insert(entity.uuid.clone(), entity);
    }

    pub fn insert_remote(&mut self, record: RawRecord) {
        self.remote.insert(record.id.clone(), record);
    }
}

impl EntitySource for MemorySource {
    fn local(&self, uuid: &str) -> Option<&ContentEntity> {
        self.local.get(uuid)
    }

    fn remote(&self, uuid: &str) -> Option<&RawRecord> {
        self.remote.get(uuid)
    }
}

/// Outcome of expanding a referenced entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Expansion {
    Parsed(ParsedEntity),
    /// Already expanded on this side of the current parse call.
    Visited,
    /// Target not available on this side.
    Unresolved,
}

/// State of one parse call, handed to comparators.
pub struct DiffContext<'a> {
    engine: &'a DiffEngine,
    source: &'a dyn EntitySource,
    language: Option<&'a str>,
    is_remote: bool,
    visited: HashSet<(String, bool)>,
}

impl<'a> DiffContext<'a> {
    pub fn is_remote(&self) -> bool {
        self.is_remote
    }

    pub fn language(&self) -> Option<&str> {
        self.language
    }

    /// Label of a referenced entity on the side being parsed.
    pub fn reference_label(&self, entity_type: &str, uuid: &str) -> Option<String> {
        let schema = &self.engine.schema;
        let label_key = schema.label_key(entity_type)?;
        if self.is_remote {
            let record = self.source.remote(uuid)?;
            let public_name = schema
                .get(entity_type)
                .and_then(|def| def.field(label_key))
                .map(FieldDefinition::public_name)
                .unwrap_or(label_key);
            record
                .attribute(public_name)
                .and_then(Value::as_str)
                .map(str::to_string)
        } else {
            self.source.local(uuid)?.label(label_key, self.language)
        }
    }

    /// Parse a referenced entity unless it was already visited on this side.
    pub fn expand(&mut self, uuid: &str) -> Expansion {
        if self.visited.contains(&(uuid.to_string(), self.is_remote)) {
            debug!(uuid, remote = self.is_remote, "already expanded; not recursing");
            return Expansion::Visited;
        }
        let engine = self.engine;
        let source = self.source;
        if self.is_remote {
            let Some(record) = source.remote(uuid) else {
                return Expansion::Unresolved;
            };
            let entity = ContentEntity::from_record(record, &engine.definition(record.entity_type()));
            Expansion::Parsed(engine.parse_in(self, &entity, Some(record)))
        } else {
            let Some(entity) = source.local(uuid) else {
                return Expansion::Unresolved;
            };
            Expansion::Parsed(engine.parse_in(self, entity, None))
        }
    }
}

#[derive(Clone)]
pub struct DiffEngine {
    schema: Schema,
    comparators: ComparatorRegistry,
}

impl DiffEngine {
    pub fn new(schema: Schema) -> Self {
        Self::with_comparators(schema, ComparatorRegistry::with_builtin())
    }

    pub fn with_comparators(schema: Schema, comparators: ComparatorRegistry) -> Self {
        Self {
            schema,
            comparators,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn definition(&self, entity_type: &str) -> EntityTypeDefinition {
        self.schema.get(entity_type).cloned().unwrap_or_default()
    }

    /// Parse `entity`. Pass the wire record as `remote` when parsing the
    /// remote side; references are then read from its relationships.
    pub fn parse(
        &self,
        entity: &ContentEntity,
        remote: Option<&RawRecord>,
        language: Option<&str>,
        source: &dyn EntitySource,
    ) -> ParsedEntity {
        let mut ctx = DiffContext {
            engine: self,
            source,
            language,
            is_remote: remote.is_some(),
            visited: HashSet::new(),
        };
        self.parse_in(&mut ctx, entity, remote)
    }

    /// Field names never shown in a diff.
    pub fn irrelevant_fields(&self, entity_type: &str) -> HashSet<String> {
        let mut names: HashSet<String> = AUDIT_FIELDS
            .iter()
            .chain(TRANSLATION_FIELDS)
            .chain(HIERARCHY_FIELDS)
            .map(|s| s.to_string())
            .collect();
        if let Some(def) = self.schema.get(entity_type) {
            names.extend(def.keys.structural().map(str::to_string));
            names.extend(def.revision_metadata_keys.iter().cloned());
        }
        names
    }

    pub fn classify(&self, field: &FieldDefinition) -> ReferenceKind {
        if !field.is_reference() {
            return ReferenceKind::Plain;
        }
        let target = match field.field_type.as_str() {
            "file" | "image" => Some("file"),
            _ => field.target_type.as_deref(),
        };
        match target {
            Some(target) if target == "file" || self.schema.is_shareable(target) => {
                ReferenceKind::Handleable
            }
            _ => ReferenceKind::NotHandleable,
        }
    }

    /// Public names of the handleable reference fields of `entity_type`,
    /// the relationship paths a remote must side-load for a full diff.
    pub fn include_paths(&self, entity_type: &str) -> Vec<String> {
        let Some(definition) = self.schema.get(entity_type) else {
            return Vec::new();
        };
        let irrelevant = self.irrelevant_fields(entity_type);
        definition
            .fields
            .iter()
            .filter(|f| !irrelevant.contains(&f.name))
            .filter(|f| self.classify(f) == ReferenceKind::Handleable)
            .map(|f| f.public_name().to_string())
            .collect()
    }

    fn parse_in(
        &self,
        ctx: &mut DiffContext<'_>,
        entity: &ContentEntity,
        remote: Option<&RawRecord>,
    ) -> ParsedEntity {
        ctx.visited.insert((entity.uuid.clone(), ctx.is_remote));
        let irrelevant = self.irrelevant_fields(&entity.entity_type_id);
        let mut parsed = ParsedEntity::new();

        for field in entity.fields_in(ctx.language) {
            let definition = &field.definition;
            if irrelevant.contains(&definition.name) {
                continue;
            }
            let remote_items;
            let items: &[Value] = match (self.classify(definition), remote) {
                (ReferenceKind::NotHandleable, _) => continue,
                (ReferenceKind::Handleable, Some(record)) => {
                    remote_items = record
                        .relationships
                        .get(definition.public_name())
                        .map(normalize_relationship)
                        .unwrap_or_default();
                    &remote_items
                }
                _ => &field.items,
            };
            let Some(comparator) = self.comparators.find(&definition.field_type) else {
                debug!(field = %definition.name, field_type = %definition.field_type, "no comparator; skipping field");
                continue;
            };
            let value = match comparator.compare(&FieldInput { definition, items }, ctx) {
                Value::Array(mut list) if definition.cardinality == 1 && list.len() <= 1 => {
                    list.pop().unwrap_or(Value::Null)
                }
                other => other,
            };
            parsed.insert(definition.label().to_string(), value);
        }
        parsed
    }
}
