//! Schema Metadata
//!
//! Relation/field descriptors handed to the pipeline by the caller, the
//! semantic name mapping, and the `SchemaProvider` seam.

use crate::error::{NlqError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

/// Query language family targeted for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// SQL-like (PostgreSQL)
    Relational,
    /// Aggregation-pipeline-like (MongoDB shell syntax)
    Document,
}

impl Dialect {
    /// Language name used in prompts
    pub fn language(&self) -> &'static str {
        match self {
            Dialect::Relational => "SQL",
            Dialect::Document => "MongoDB",
        }
    }

    /// What a relation is called in this dialect
    pub fn relation_noun(&self) -> &'static str {
        match self {
            Dialect::Relational => "table",
            Dialect::Document => "collection",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Relational => write!(f, "relational"),
            Dialect::Document => write!(f, "document"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub is_primary_key: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            is_primary_key: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    pub fn is_numeric(&self) -> bool {
        let t = self.field_type.to_lowercase();
        if t.starts_with("interval") || t.contains("point") {
            return false;
        }
        ["int", "numeric", "decimal", "real", "double", "float", "money", "number"]
            .iter()
            .any(|n| t.contains(n))
    }

    pub fn is_temporal(&self) -> bool {
        let t = self.field_type.to_lowercase();
        t.contains("timestamp") || t.contains("date") || t.contains("time")
    }
}

/// A table (relational) or collection (document)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

impl RelationDescriptor {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Column used for "recent" ordering and time windows
    pub fn time_field(&self) -> Option<&FieldDescriptor> {
        self.field("created_at")
            .or_else(|| self.fields.iter().find(|f| f.is_temporal()))
            .or_else(|| {
                self.fields
                    .iter()
                    .find(|f| f.name.ends_with("_at") || f.name.ends_with("_date"))
            })
    }

    /// Column used for "top"/"average" style questions
    pub fn measure_field(&self) -> Option<&FieldDescriptor> {
        const PREFERRED: [&str; 6] = ["amount", "total", "price", "value", "revenue", "score"];
        let candidates: Vec<&FieldDescriptor> = self
            .fields
            .iter()
            .filter(|f| f.is_numeric() && !f.is_primary_key && !f.name.ends_with("_id") && f.name != "id")
            .collect();

        candidates
            .iter()
            .find(|f| PREFERRED.iter().any(|p| f.name.to_lowercase().contains(p)))
            .or_else(|| candidates.first())
            .copied()
    }
}

/// Immutable per-request view of the target database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub dialect: Dialect,
    #[serde(default)]
    pub relations: Vec<RelationDescriptor>,
}

impl SchemaDescriptor {
    pub fn new(dialect: Dialect, relations: Vec<RelationDescriptor>) -> Self {
        Self { dialect, relations }
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDescriptor> {
        self.relations
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    pub fn relation_names(&self) -> Vec<String> {
        self.relations.iter().map(|r| r.name.clone()).collect()
    }
}

/// Semantic name → actual relation name. Annotates prompts only.
pub type NameMapping = BTreeMap<String, String>;

/// What a `SchemaProvider` hands back for a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaBundle {
    pub schema: SchemaDescriptor,
    #[serde(default)]
    pub mapping: NameMapping,
}

impl SchemaBundle {
    pub fn new(schema: SchemaDescriptor) -> Self {
        Self {
            schema,
            mapping: NameMapping::new(),
        }
    }

    pub fn with_mapping(mut self, mapping: NameMapping) -> Self {
        self.mapping = mapping;
        self
    }

    /// Load a bundle from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| NlqError::Schema(format!("Failed to parse schema file {}: {}", path.display(), e)))
    }
}

/// Opaque handle naming a target database
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionRef {
    pub id: String,
    pub dialect: Dialect,
}

impl ConnectionRef {
    pub fn new(id: impl Into<String>, dialect: Dialect) -> Self {
        Self {
            id: id.into(),
            dialect,
        }
    }
}

impl fmt::Display for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.dialect)
    }
}

/// Supplies schema metadata for a connection.
///
/// Must be idempotent and side-effect-free from the pipeline's perspective.
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn get_schema(&self, connection: &ConnectionRef) -> Result<SchemaBundle>;
}

/// Schema provider backed by bundles registered up front
#[derive(Debug, Default, Clone)]
pub struct StaticSchemaProvider {
    bundles: HashMap<String, SchemaBundle>,
}

impl StaticSchemaProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bundle(mut self, connection_id: impl Into<String>, bundle: SchemaBundle) -> Self {
        self.bundles.insert(connection_id.into(), bundle);
        self
    }
}

#[async_trait]
impl SchemaProvider for StaticSchemaProvider {
    async fn get_schema(&self, connection: &ConnectionRef) -> Result<SchemaBundle> {
        self.bundles
            .get(&connection.id)
            .cloned()
            .ok_or_else(|| NlqError::Schema(format!("No schema registered for connection {}", connection)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> RelationDescriptor {
        RelationDescriptor::new(
            "users",
            vec![
                FieldDescriptor::new("id", "integer").primary_key(),
                FieldDescriptor::new("name", "text"),
                FieldDescriptor::new("created_at", "timestamp with time zone"),
            ],
        )
    }

    #[test]
    fn test_time_field_prefers_created_at() {
        assert_eq!(users().time_field().map(|f| f.name.as_str()), Some("created_at"));
    }

    #[test]
    fn test_measure_field_skips_keys() {
        let payments = RelationDescriptor::new(
            "payments",
            vec![
                FieldDescriptor::new("id", "integer").primary_key(),
                FieldDescriptor::new("user_id", "integer"),
                FieldDescriptor::new("amount", "numeric"),
            ],
        );
        assert_eq!(payments.measure_field().map(|f| f.name.as_str()), Some("amount"));
        assert!(users().measure_field().is_none());
    }

    #[test]
    fn test_schema_json_shape() {
        let json = r#"{
            "dialect": "relational",
            "relations": [{"name": "users", "fields": [{"name": "id", "type": "integer", "is_primary_key": true}]}]
        }"#;
        let schema: SchemaDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(schema.dialect, Dialect::Relational);
        assert!(schema.relation("USERS").is_some());
        assert!(schema.relations[0].fields[0].is_primary_key);
    }
}
