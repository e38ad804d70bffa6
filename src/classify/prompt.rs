//! The classification prompt.

use handlebars::Handlebars;

use crate::{prelude::*, schema::CLASSIFICATION_SCHEMA};

/// The system message.
const SYSTEM_PROMPT: &str = "You are a document analysis assistant. Respond only with valid JSON.";

/// The user message. Triple braces keep handlebars from HTML-escaping the
/// document text.
const USER_TEMPLATE: &str = r#"Please analyze the following document text and extract information according to this schema:

Schema: {{{schema}}}
{{#if classification}}

IMPORTANT CLASSIFICATION GUIDELINES:
- For document_type: Use "promotion" for ads, marketing materials, offers, deals, or promotional content (email, social media, direct mail, etc.)
- If the document type is unclear, use "other"
{{/if}}

Document Text:
{{{text}}}

Please respond with a JSON object that follows the schema structure exactly."#;

/// A rendered prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

/// Renders prompts for each classification pass.
#[derive(Debug)]
pub struct ClassificationPrompt {
    handlebars: Handlebars<'static>,
}

impl ClassificationPrompt {
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        handlebars
            .register_template_string("user", USER_TEMPLATE)
            .context("cannot compile classification prompt")?;
        Ok(Self { handlebars })
    }

    /// Render the prompt for one pass.
    pub fn render(&self, schema_name: &str, schema: &Value, text: &str) -> Result<RenderedPrompt> {
        let schema = serde_json::to_string_pretty(schema)?;
        let bindings = json!({
            "schema": schema,
            "classification": schema_name == CLASSIFICATION_SCHEMA,
            "text": text,
        });
        let user = self
            .handlebars
            .render("user", &bindings)
            .context("cannot render classification prompt")?;
        Ok(RenderedPrompt {
            system: SYSTEM_PROMPT.to_owned(),
            user,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let prompt = ClassificationPrompt::new().unwrap();
        let schema = json!({"type": "object"});
        let rendered = prompt
            .render("classification", &schema, "Total <b>$5</b> & tax")
            .unwrap();
        assert_eq!(rendered.system, SYSTEM_PROMPT);
        assert!(rendered.user.contains("IMPORTANT CLASSIFICATION GUIDELINES"));
        assert!(rendered.user.contains("Total <b>$5</b> & tax"));
        assert!(rendered.user.contains("\"type\": \"object\""));

        let rendered = prompt.render("invoice", &schema, "x").unwrap();
        assert!(!rendered.user.contains("GUIDELINES"));
    }
}
