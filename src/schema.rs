//! Entity type and field definitions shared by the query compiler and the
//! diff engine.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_LANGCODE_PATH: &str = "langcode";

/// Field types that point at other entities.
const REFERENCE_FIELD_TYPES: &[&str] = &[
    "entity_reference",
    "entity_reference_revisions",
    "dynamic_entity_reference",
    "file",
    "image",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityKeys {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub langcode: Option<String>,
    #[serde(default)]
    pub bundle: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub default_langcode: Option<String>,
    #[serde(default)]
    pub revision_translation_affected: Option<String>,
}

impl EntityKeys {
    /// Key field names excluding label and langcode.
    pub fn structural(&self) -> impl Iterator<Item = &str> {
        [
            &self.id,
            &self.uuid,
            &self.bundle,
            &self.revision,
            &self.default_langcode,
            &self.revision_translation_affected,
        ]
        .into_iter()
        .filter_map(|k| k.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub field_type: String,
    /// `1` for single-valued fields, `-1` for unlimited.
    #[serde(default = "single")]
    pub cardinality: i32,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub public_name: Option<String>,
}

fn single() -> i32 {
    1
}

impl FieldDefinition {
    pub fn new(name: &str, field_type: &str) -> Self {
        Self {
            name: name.to_string(),
            label: None,
            field_type: field_type.to_string(),
            cardinality: 1,
            target_type: None,
            public_name: None,
        }
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    pub fn public_name(&self) -> &str {
        self.public_name.as_deref().unwrap_or(&self.name)
    }

    pub fn is_reference(&self) -> bool {
        REFERENCE_FIELD_TYPES.contains(&self.field_type.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityTypeDefinition {
    #[serde(default)]
    pub keys: EntityKeys,
    #[serde(default)]
    pub revision_metadata_keys: Vec<String>,
    /// Content entity whose references the diff engine may follow.
    #[serde(default)]
    pub shareable: bool,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
}

impl EntityTypeDefinition {
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Schema {
    pub types: BTreeMap<String, EntityTypeDefinition>,
}

impl Schema {
    pub fn get(&self, entity_type: &str) -> Option<&EntityTypeDefinition> {
        self.types.get(entity_type)
    }

    /// Public path of the entity type's language key on the remote.
    pub fn language_path(&self, entity_type: &str) -> String {
        let Some(def) = self.get(entity_type) else {
            return DEFAULT_LANGCODE_PATH.to_string();
        };
        match def.keys.langcode.as_deref() {
            Some(key) => def
                .field(key)
                .map(|f| f.public_name().to_string())
                .unwrap_or_else(|| key.to_string()),
            None => DEFAULT_LANGCODE_PATH.to_string(),
        }
    }

    /// Label key of an entity type, used to render references.
    pub fn label_key(&self, entity_type: &str) -> Option<&str> {
        self.get(entity_type)?.keys.label.as_deref()
    }

    pub fn is_shareable(&self, entity_type: &str) -> bool {
        entity_type != "user" && self.get(entity_type).map(|d| d.shareable).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Schema {
        serde_yaml::from_str(
            r#"
node:
  shareable: true
  keys: { id: nid, uuid: uuid, label: title, langcode: langcode }
  fields:
    - { name: langcode, type: language, public_name: lang }
taxonomy_term:
  shareable: true
  keys: { id: tid, label: name }
user:
  shareable: true
"#,
        )
        .unwrap()
    }

    #[test]
    fn language_path_uses_public_name() {
        let schema = sample();
        assert_eq!(schema.language_path("node"), "lang");
        assert_eq!(schema.language_path("taxonomy_term"), "langcode");
        assert_eq!(schema.language_path("unknown"), "langcode");
    }

    #[test]
    fn users_are_never_shareable() {
        let schema = sample();
        assert!(schema.is_shareable("node"));
        assert!(!schema.is_shareable("user"));
        assert!(!schema.is_shareable("menu"));
    }
}
