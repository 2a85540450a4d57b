//! Row models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

/// One stored translation of an imported record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntityRow {
    pub id: i64,
    pub uuid: String,
    pub langcode: String,
    pub entity_type_id: String,
    pub bundle: String,
    /// The raw remote record as JSON.
    pub payload: String,
}
