//! Classification schemas.
//!
//! A schema directory holds one file per schema, named after the schema:
//! `invoice.json` is a raw JSON Schema, and `invoice.toml` is a
//! [`SimpleSchema`], which is converted to JSON Schema on load.

use std::collections::BTreeMap;

use serde_json::Map;

use crate::{async_utils::io::read_json_or_toml, prelude::*};

/// The schema used for the first classification pass.
pub const CLASSIFICATION_SCHEMA: &str = "classification";

/// Used when the schema directory doesn't define `classification`.
const BUILTIN_CLASSIFICATION: &str = r#"
description = "Classify the document and summarize it."
title = "classification"

[properties.document_type]
description = """The kind of document. Use "promotion" for ads, marketing \
materials, offers, deals or other promotional content. Use "other" if the \
type is unclear."""
enum = ["invoice", "receipt", "banking", "credit_card", "insurance", "promotion", "contract", "letter", "other"]

[properties.summary]
description = "A one-sentence summary of the document."

[properties.confidence]
description = "How confident you are in document_type, from 0 to 1."
type = "number"

[properties.key_entities]
description = "Important people, companies, accounts and amounts mentioned."

[properties.key_entities.items]
description = "One entity, as it appears in the text."
"#;

/// A simplified version of JSON Schema.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SimpleSchema {
    /// A description of this value.
    pub description: String,

    /// The details of this schema.
    #[serde(flatten)]
    pub details: SimpleSchemaDetails,
}

/// The details of a schema.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged, deny_unknown_fields, rename_all = "snake_case")]
pub enum SimpleSchemaDetails {
    /// An array.
    Array {
        /// The items in the array.
        items: Box<SimpleSchema>,
    },
    /// A JSON object.
    ///
    /// All fields will be automatically marked as required, and
    /// `additionalProperties` will be set to `false`.
    Object {
        /// The properties of the object.
        properties: BTreeMap<String, SimpleSchema>,

        /// The title of this object.
        #[serde(default)]
        title: Option<String>,
    },
    Scalar {
        /// The type of this scalar.
        #[serde(default)]
        r#type: ScalarType,

        /// Allowed values.
        #[serde(default)]
        r#enum: Option<Vec<Value>>,
    },
}

/// Basic types we support.
#[derive(Debug, Default, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub enum ScalarType {
    /// A string.
    #[default]
    String,

    /// A number.
    Number,

    /// A boolean.
    Boolean,
}

impl SimpleSchema {
    /// Convert to a standalone JSON Schema document.
    pub fn to_json_schema_document(&self) -> Value {
        let mut schema = self.to_json_schema();
        schema["$schema"] = Value::String("http://json-schema.org/draft-07/schema#".to_owned());
        schema
    }

    /// Convert this schema to a JSON Schema.
    pub fn to_json_schema(&self) -> Value {
        let description = Value::String(self.description.clone());
        let mut schema = match &self.details {
            SimpleSchemaDetails::Array { items } => json!({
                "type": "array",
                "items": items.to_json_schema(),
            }),
            SimpleSchemaDetails::Object { title, properties } => {
                let mut schema = json!({
                    "type": "object",
                    "properties": properties
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_json_schema()))
                        .collect::<Map<_, _>>(),
                    // OpenAI requires `additionalProperties` to be false.
                    "additionalProperties": false,
                    // OpenAI requires all properties to be required.
                    "required": properties.keys().cloned().collect::<Vec<_>>(),
                });
                if let Some(title) = title {
                    schema["title"] = Value::String(title.clone());
                }
                schema
            }
            SimpleSchemaDetails::Scalar { r#type, r#enum } => {
                let mut schema = json!({ "type": r#type.as_str() });
                if let Some(values) = r#enum {
                    schema["enum"] = Value::Array(values.clone());
                }
                schema
            }
        };
        schema["description"] = description;
        schema
    }
}

impl ScalarType {
    fn as_str(&self) -> &'static str {
        match self {
            ScalarType::String => "string",
            ScalarType::Number => "number",
            ScalarType::Boolean => "boolean",
        }
    }
}

/// A schema with its compiled validator.
struct CompiledSchema {
    json: Value,
    validator: jsonschema::Validator,
}

/// Every schema available to the classification stage, by name.
#[derive(Default)]
pub struct SchemaSet {
    schemas: BTreeMap<String, CompiledSchema>,
}

impl SchemaSet {
    /// Just the built-in classification schema.
    pub fn builtin() -> Result<Self> {
        let mut set = Self::default();
        set.insert_builtin_classification()?;
        Ok(set)
    }

    /// Load every `*.json` and `*.toml` schema in `dir`, plus the built-in
    /// classification schema if `dir` doesn't provide one.
    pub async fn load(dir: Option<&Path>) -> Result<Self> {
        let mut set = Self::default();
        if let Some(dir) = dir {
            let mut paths = vec![];
            let mut entries = tokio::fs::read_dir(dir)
                .await
                .with_context(|| format!("cannot read schema directory {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                paths.push(entry.path());
            }
            paths.sort();
            for path in paths {
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let json = match path.extension().and_then(|e| e.to_str()) {
                    Some("json") => read_json_or_toml::<Value>(&path).await?,
                    Some("toml") => read_json_or_toml::<SimpleSchema>(&path)
                        .await?
                        .to_json_schema_document(),
                    _ => continue,
                };
                set.insert(name, json)
                    .with_context(|| format!("invalid schema {}", path.display()))?;
                debug!(%name, "Loaded schema");
            }
        }
        if !set.contains(CLASSIFICATION_SCHEMA) {
            set.insert_builtin_classification()?;
        }
        info!(schemas = ?set.names(), "Schemas loaded");
        Ok(set)
    }

    fn insert_builtin_classification(&mut self) -> Result<()> {
        let schema = toml::from_str::<SimpleSchema>(BUILTIN_CLASSIFICATION)
            .context("built-in classification schema should parse")?;
        self.insert(CLASSIFICATION_SCHEMA, schema.to_json_schema_document())
    }

    /// Add or replace a schema.
    pub fn insert(&mut self, name: &str, json: Value) -> Result<()> {
        let validator = jsonschema::validator_for(&json)
            .map_err(|err| err.to_owned())
            .with_context(|| format!("schema {name} is not a valid JSON Schema"))?;
        self.schemas
            .insert(name.to_owned(), CompiledSchema { json, validator });
        Ok(())
    }

    /// Do we have a schema with this name?
    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// The JSON Schema with this name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.schemas.get(name).map(|s| &s.json)
    }

    /// Schema names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.schemas.keys().map(String::as_str).collect()
    }

    /// Check a response against the named schema.
    pub fn validate(&self, name: &str, response: &Value) -> Result<()> {
        let schema = self
            .schemas
            .get(name)
            .ok_or_else(|| anyhow!("unknown schema {name:?}"))?;
        schema
            .validator
            .validate(response)
            .map_err(|err| err.to_owned())
            .with_context(|| format!("response does not match schema {name}: {response}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_schema() {
        let schema_toml = r#"
description = "Invoice fields."

[properties.vendor]
description = "Who sent the invoice."

[properties.total]
description = "The amount due."
type = "number"
"#;
        let schema: SimpleSchema = toml::from_str(schema_toml).unwrap();
        let expected_json = json!({
            "description": "Invoice fields.",
            "type": "object",
            "properties": {
                "total": {
                    "description": "The amount due.",
                    "type": "number"
                },
                "vendor": {
                    "description": "Who sent the invoice.",
                    "type": "string"
                }
            },
            "additionalProperties": false,
            "required": ["total", "vendor"],
        });
        assert_eq!(schema.to_json_schema(), expected_json);
    }

    #[test]
    fn test_builtin_classification_validates_responses() {
        let set = SchemaSet::builtin().unwrap();
        let schema = set.get(CLASSIFICATION_SCHEMA).unwrap();
        assert_eq!(schema["title"], "classification");
        assert_eq!(schema["properties"]["document_type"]["enum"][0], "invoice");

        let good = json!({
            "document_type": "receipt",
            "summary": "A coffee receipt.",
            "confidence": 0.9,
            "key_entities": ["Cafe Luna"],
        });
        set.validate(CLASSIFICATION_SCHEMA, &good).unwrap();

        let bad = json!({"document_type": "spaceship", "summary": "?"});
        assert!(set.validate(CLASSIFICATION_SCHEMA, &bad).is_err());
        assert!(set.validate("nope", &good).is_err());
    }

    #[tokio::test]
    async fn test_load_schema_dir() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("invoice.toml"),
            "description = \"Invoice.\"\n[properties.vendor]\ndescription = \"Vendor.\"\n",
        )
        .await
        .unwrap();
        tokio::fs::write(
            dir.path().join("banking.json"),
            json!({"type": "object", "properties": {"bank": {"type": "string"}}}).to_string(),
        )
        .await
        .unwrap();
        tokio::fs::write(dir.path().join("README.md"), "not a schema")
            .await
            .unwrap();

        let set = SchemaSet::load(Some(dir.path())).await.unwrap();
        assert_eq!(set.names(), vec!["banking", "classification", "invoice"]);
        set.validate("invoice", &json!({"vendor": "Acme"})).unwrap();
        assert!(set.validate("invoice", &json!({})).is_err());
    }
}
