//! Per-field-type comparators and the registry that picks one per field.
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use super::{DiffContext, Expansion};
use crate::schema::FieldDefinition;

pub struct FieldInput<'a> {
    pub definition: &'a FieldDefinition,
    pub items: &'a [Value],
}

/// Renders a field's items into a reviewable value, usually a list.
pub trait FieldDiffComparator: Send + Sync {
    fn id(&self) -> &'static str;
    fn supports(&self, field_type: &str) -> bool;
    fn compare(&self, field: &FieldInput<'_>, ctx: &mut DiffContext<'_>) -> Value;
}

#[derive(Clone, Default)]
pub struct ComparatorRegistry {
    entries: Vec<(i32, Arc<dyn FieldDiffComparator>)>,
}

impl ComparatorRegistry {
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(0, Arc::new(CoreComparator));
        registry.register(0, Arc::new(TextComparator));
        registry.register(0, Arc::new(LinkComparator));
        registry.register(0, Arc::new(TimestampComparator));
        registry.register(0, Arc::new(FileComparator));
        registry.register(0, Arc::new(EntityReferenceComparator));
        registry.register(0, Arc::new(EntityReferenceRevisionsComparator));
        registry
    }

    pub fn register(&mut self, weight: i32, comparator: Arc<dyn FieldDiffComparator>) {
        self.entries.push((weight, comparator));
    }

    /// Lowest weight wins; equal weights keep registration order.
    pub fn find(&self, field_type: &str) -> Option<Arc<dyn FieldDiffComparator>> {
        self.entries
            .iter()
            .filter(|(_, c)| c.supports(field_type))
            .min_by_key(|(weight, _)| *weight)
            .map(|(_, c)| c.clone())
    }
}

fn pick(item: &Value, keys: &[&str]) -> Value {
    let mut out = Map::new();
    for key in keys {
        if let Some(value) = item.get(*key).filter(|v| !v.is_null()) {
            out.insert((*key).to_string(), value.clone());
        }
    }
    Value::Object(out)
}

fn target_uuid(item: &Value) -> Option<&str> {
    item.get("target_uuid").and_then(Value::as_str)
}

fn target_type<'a>(item: &'a Value, field: &'a FieldDefinition) -> &'a str {
    item.get("target_type")
        .and_then(Value::as_str)
        .or(field.target_type.as_deref())
        .unwrap_or_default()
}

pub struct CoreComparator;

const CORE_TYPES: &[&str] = &[
    "string",
    "string_long",
    "integer",
    "float",
    "decimal",
    "boolean",
    "email",
    "uri",
    "telephone",
    "list_string",
    "list_integer",
    "list_float",
    "language",
    "uuid",
    "map",
];

impl FieldDiffComparator for CoreComparator {
    fn id(&self) -> &'static str {
        "core"
    }

    fn supports(&self, field_type: &str) -> bool {
        CORE_TYPES.contains(&field_type)
    }

    fn compare(&self, field: &FieldInput<'_>, _ctx: &mut DiffContext<'_>) -> Value {
        Value::Array(
            field
                .items
                .iter()
                .map(|item| item.get("value").cloned().unwrap_or_else(|| item.clone()))
                .collect(),
        )
    }
}

pub struct TextComparator;

impl FieldDiffComparator for TextComparator {
    fn id(&self) -> &'static str {
        "text"
    }

    fn supports(&self, field_type: &str) -> bool {
        matches!(field_type, "text" | "text_long" | "text_with_summary")
    }

    fn compare(&self, field: &FieldInput<'_>, _ctx: &mut DiffContext<'_>) -> Value {
        let keys: &[&str] = if field.definition.field_type == "text_with_summary" {
            &["value", "format", "summary"]
        } else {
            &["value", "format"]
        };
        Value::Array(field.items.iter().map(|item| pick(item, keys)).collect())
    }
}

pub struct LinkComparator;

impl FieldDiffComparator for LinkComparator {
    fn id(&self) -> &'static str {
        "link"
    }

    fn supports(&self, field_type: &str) -> bool {
        field_type == "link"
    }

    fn compare(&self, field: &FieldInput<'_>, _ctx: &mut DiffContext<'_>) -> Value {
        Value::Array(
            field
                .items
                .iter()
                .map(|item| pick(item, &["uri", "title"]))
                .collect(),
        )
    }
}

pub struct TimestampComparator;

fn render_timestamp(value: &Value) -> Value {
    let parsed = match value {
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        Value::String(s) => s
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .or_else(|| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }),
        _ => None,
    };
    match parsed {
        Some(dt) => Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
        None => value.clone(),
    }
}

impl FieldDiffComparator for TimestampComparator {
    fn id(&self) -> &'static str {
        "timestamp"
    }

    fn supports(&self, field_type: &str) -> bool {
        matches!(field_type, "timestamp" | "created" | "changed" | "datetime")
    }

    fn compare(&self, field: &FieldInput<'_>, _ctx: &mut DiffContext<'_>) -> Value {
        Value::Array(
            field
                .items
                .iter()
                .map(|item| render_timestamp(item.get("value").unwrap_or(item)))
                .collect(),
        )
    }
}

pub struct FileComparator;

impl FieldDiffComparator for FileComparator {
    fn id(&self) -> &'static str {
        "file"
    }

    fn supports(&self, field_type: &str) -> bool {
        matches!(field_type, "file" | "image")
    }

    fn compare(&self, field: &FieldInput<'_>, _ctx: &mut DiffContext<'_>) -> Value {
        Value::Array(
            field
                .items
                .iter()
                .filter_map(|item| {
                    let uuid = target_uuid(item)?;
                    let mut out = Map::new();
                    out.insert("file".into(), Value::String(uuid.to_string()));
                    if let Value::Object(extra) = pick(item, &["alt", "title", "description"]) {
                        out.extend(extra);
                    }
                    Some(Value::Object(out))
                })
                .collect(),
        )
    }
}

/// Renders each target by label. Targets whose label cannot be resolved
/// are left out.
pub struct EntityReferenceComparator;

impl FieldDiffComparator for EntityReferenceComparator {
    fn id(&self) -> &'static str {
        "entity_reference"
    }

    fn supports(&self, field_type: &str) -> bool {
        matches!(field_type, "entity_reference" | "dynamic_entity_reference")
    }

    fn compare(&self, field: &FieldInput<'_>, ctx: &mut DiffContext<'_>) -> Value {
        Value::Array(
            field
                .items
                .iter()
                .filter_map(|item| {
                    let uuid = target_uuid(item)?;
                    let entity_type = target_type(item, field.definition);
                    let label = ctx.reference_label(entity_type, uuid);
                    if label.is_none() {
                        debug!(uuid, entity_type, "reference target unresolved; omitted");
                    }
                    label.map(Value::String)
                })
                .collect(),
        )
    }
}

/// Expands composed children in place. Already visited targets stay as
/// their UUID; unresolved ones are left out.
pub struct EntityReferenceRevisionsComparator;

impl FieldDiffComparator for EntityReferenceRevisionsComparator {
    fn id(&self) -> &'static str {
        "entity_reference_revisions"
    }

    fn supports(&self, field_type: &str) -> bool {
        field_type == "entity_reference_revisions"
    }

    fn compare(&self, field: &FieldInput<'_>, ctx: &mut DiffContext<'_>) -> Value {
        let mut out = Vec::with_capacity(field.items.len());
        for item in field.items {
            let Some(uuid) = target_uuid(item) else {
                continue;
            };
            match ctx.expand(uuid) {
                Expansion::Parsed(parsed) => out.push(Value::Object(parsed)),
                Expansion::Visited => out.push(Value::String(uuid.to_string())),
                Expansion::Unresolved => {
                    debug!(uuid, "child entity unresolved; omitted");
                }
            }
        }
        Value::Array(out)
    }
}
