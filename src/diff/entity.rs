//! Entities as the diff engine reads them: field item lists in declaration
//! order, one list per translation.
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::model::{RawRecord, LANGCODE_NOT_SPECIFIED};
use crate::schema::{EntityTypeDefinition, FieldDefinition};

/// Reference ids JSON:API emits for targets it cannot expose.
const UNRESOLVED_REFERENCE_IDS: &[&str] = &["missing", "virtual"];

#[derive(Debug, Clone, PartialEq)]
pub struct FieldItems {
    pub definition: FieldDefinition,
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContentEntity {
    pub entity_type_id: String,
    pub bundle: String,
    pub uuid: String,
    /// Language of `fields`.
    pub langcode: String,
    pub fields: Vec<FieldItems>,
    pub translations: BTreeMap<String, Vec<FieldItems>>,
}

impl ContentEntity {
    /// Build from one wire record. Undeclared entity types get their fields
    /// inferred from the record itself.
    pub fn from_record(record: &RawRecord, definition: &EntityTypeDefinition) -> Self {
        let definitions = if definition.fields.is_empty() {
            infer_fields(record)
        } else {
            definition.fields.clone()
        };
        let fields = definitions
            .into_iter()
            .map(|definition| {
                let items = field_items(record, &definition);
                FieldItems { definition, items }
            })
            .collect();
        Self {
            entity_type_id: record.entity_type().to_string(),
            bundle: record.bundle().to_string(),
            uuid: record.id.clone(),
            langcode: record
                .langcode()
                .unwrap_or(LANGCODE_NOT_SPECIFIED)
                .to_string(),
            fields,
            translations: BTreeMap::new(),
        }
    }

    /// First record is the default translation, the rest become translations.
    pub fn from_records(records: &[RawRecord], definition: &EntityTypeDefinition) -> Option<Self> {
        let (first, rest) = records.split_first()?;
        let mut entity = Self::from_record(first, definition);
        for record in rest {
            let translation = Self::from_record(record, definition);
            if translation.langcode != entity.langcode {
                entity
                    .translations
                    .insert(translation.langcode, translation.fields);
            }
        }
        Some(entity)
    }

    /// Fields in `language`, falling back to the default translation.
    pub fn fields_in(&self, language: Option<&str>) -> &[FieldItems] {
        match language {
            Some(lang) if lang != self.langcode => self
                .translations
                .get(lang)
                .map(Vec::as_slice)
                .unwrap_or(&self.fields),
            _ => &self.fields,
        }
    }

    pub fn label(&self, label_key: &str, language: Option<&str>) -> Option<String> {
        let field = self
            .fields_in(language)
            .iter()
            .find(|f| f.definition.name == label_key)?;
        match field.items.first()? {
            Value::Object(item) => item.get("value").and_then(Value::as_str).map(str::to_string),
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// UUIDs referenced from any translation.
    pub fn reference_targets(&self) -> Vec<String> {
        self.fields
            .iter()
            .chain(self.translations.values().flatten())
            .filter(|f| f.definition.is_reference())
            .flat_map(|f| f.items.iter())
            .filter_map(|item| item.get("target_uuid").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }
}

/// Items of one field read from a wire record.
pub fn field_items(record: &RawRecord, definition: &FieldDefinition) -> Vec<Value> {
    let public_name = definition.public_name();
    if definition.is_reference() {
        return record
            .relationships
            .get(public_name)
            .map(normalize_relationship)
            .unwrap_or_default();
    }
    record
        .attributes
        .get(public_name)
        .map(normalize_attribute)
        .unwrap_or_default()
}

/// Flatten a relationship's `data` member into reference items carrying
/// `target_type`, `target_bundle`, `target_uuid` and any meta properties.
pub fn normalize_relationship(relationship: &Value) -> Vec<Value> {
    let data = match relationship {
        Value::Object(map) if map.contains_key("data") => &map["data"],
        other => other,
    };
    let references: Vec<&Value> = match data {
        Value::Array(list) => list.iter().collect(),
        Value::Object(_) => vec![data],
        _ => Vec::new(),
    };
    references
        .into_iter()
        .filter_map(|reference| {
            let uuid = reference.get("id").and_then(Value::as_str)?;
            if UNRESOLVED_REFERENCE_IDS.contains(&uuid) {
                return None;
            }
            let resource_type = reference.get("type").and_then(Value::as_str).unwrap_or_default();
            let (target_type, target_bundle) = resource_type
                .split_once("--")
                .unwrap_or((resource_type, resource_type));
            let mut item = Map::new();
            item.insert("target_type".into(), Value::String(target_type.to_string()));
            item.insert("target_bundle".into(), Value::String(target_bundle.to_string()));
            item.insert("target_uuid".into(), Value::String(uuid.to_string()));
            if let Some(Value::Object(meta)) = reference.get("meta") {
                for (key, value) in meta {
                    if !key.starts_with("drupal_internal__") {
                        item.insert(key.clone(), value.clone());
                    }
                }
            }
            Some(Value::Object(item))
        })
        .collect()
}

fn normalize_attribute(value: &Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(list) => list.iter().filter(|v| !v.is_null()).map(wrap_item).collect(),
        other => vec![wrap_item(other)],
    }
}

fn wrap_item(value: &Value) -> Value {
    match value {
        Value::Object(_) => value.clone(),
        scalar => {
            let mut item = Map::new();
            item.insert("value".into(), scalar.clone());
            Value::Object(item)
        }
    }
}

fn infer_fields(record: &RawRecord) -> Vec<FieldDefinition> {
    let attributes = record
        .attributes
        .iter()
        .filter(|(name, _)| !name.starts_with("drupal_internal__"))
        .map(|(name, value)| {
            let field_type = if value.is_object() { "map" } else { "string" };
            let mut definition = FieldDefinition::new(name, field_type);
            if value.is_array() {
                definition.cardinality = -1;
            }
            definition
        });
    let relationships = record.relationships.iter().map(|(name, value)| {
        let mut definition = FieldDefinition::new(name, "entity_reference");
        let data = value.get("data").unwrap_or(value);
        if data.is_array() {
            definition.cardinality = -1;
        }
        definition.target_type = normalize_relationship(value)
            .first()
            .and_then(|item| item.get("target_type"))
            .and_then(Value::as_str)
            .map(str::to_string);
        definition
    });
    attributes.chain(relationships).collect()
}
