//! Offline classifier.
//!
//! Builds a response that satisfies the schema using only the document text:
//! enum strings are picked by looking for the enum value in the text, a
//! `summary` field gets the first line of text, and everything else gets an
//! empty value of the right type. Good enough to exercise the whole pipeline
//! without a model.

use crate::{prelude::*, retry::retry_result_ok};

use super::{Classifier, ClassifyRequest, ClassifyRetryResult};

/// Offline classifier for testing.
#[derive(Debug)]
pub struct EchoClassifier;

#[async_trait]
impl Classifier for EchoClassifier {
    async fn classify(&self, request: &ClassifyRequest<'_>) -> ClassifyRetryResult<Value> {
        let text = request.text.to_lowercase();
        retry_result_ok(fill(request.schema, "", request.text, &text))
    }
}

/// Build a value matching `schema`.
fn fill(schema: &Value, field: &str, text: &str, lower_text: &str) -> Value {
    if let Some(values) = schema.get("enum").and_then(Value::as_array) {
        return pick_enum(values, lower_text);
    }
    match schema.get("type").and_then(Value::as_str) {
        Some("object") => {
            let properties = schema
                .get("properties")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            Value::Object(
                properties
                    .iter()
                    .map(|(name, prop)| (name.clone(), fill(prop, name, text, lower_text)))
                    .collect(),
            )
        }
        Some("array") => json!([]),
        Some("number") | Some("integer") => json!(0),
        Some("boolean") => json!(false),
        Some("null") => Value::Null,
        _ if field == "summary" => {
            let first_line = text
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty() && !line.starts_with("--- Page"))
                .unwrap_or_default();
            Value::String(first_line.to_owned())
        }
        _ => Value::String(String::new()),
    }
}

/// The first enum value that appears in the text, else `other` if allowed,
/// else the first value.
fn pick_enum(values: &[Value], lower_text: &str) -> Value {
    let found = values.iter().find(|value| {
        value.as_str().is_some_and(|s| {
            let needle = s.replace('_', " ").to_lowercase();
            !needle.is_empty() && lower_text.contains(&needle)
        })
    });
    found
        .or_else(|| values.iter().find(|v| v.as_str() == Some("other")))
        .or_else(|| values.first())
        .cloned()
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use keen_retry::RetryResult;

    use super::*;
    use crate::schema::{CLASSIFICATION_SCHEMA, SchemaSet};

    #[tokio::test]
    async fn test_echo_satisfies_builtin_schema() {
        let schemas = SchemaSet::builtin().unwrap();
        let schema = schemas.get(CLASSIFICATION_SCHEMA).unwrap();
        let text = "--- Page 1 ---\nACME Corp INVOICE #42\nTotal due: $10\n\n";
        let request = ClassifyRequest {
            pass: "classification",
            schema_name: CLASSIFICATION_SCHEMA,
            schema,
            text,
        };
        let RetryResult::Ok { output, .. } = EchoClassifier.classify(&request).await else {
            panic!("echo classifier should not fail");
        };
        assert_eq!(output["document_type"], "invoice");
        assert_eq!(output["summary"], "ACME Corp INVOICE #42");
        schemas.validate(CLASSIFICATION_SCHEMA, &output).unwrap();
    }

    #[test]
    fn test_pick_enum_falls_back_to_other() {
        let values = vec![json!("invoice"), json!("other")];
        assert_eq!(pick_enum(&values, "a birthday card"), json!("other"));
        let values = vec![json!("credit_card"), json!("letter")];
        assert_eq!(pick_enum(&values, "your new credit card"), json!("credit_card"));
    }
}
