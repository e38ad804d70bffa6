//! Pipeline configuration.
//!
//! A [`PipelineConfig`] is loaded once (from a TOML or JSON file, then
//! command-line overrides), wrapped in an [`Arc`], and handed to every stage
//! invocation as an immutable snapshot.

use std::collections::BTreeMap;

use chrono::TimeDelta;

use crate::{
    async_utils::io::read_json_or_toml, clock::seconds, prelude::*, rate_limit::RateLimit,
};

/// Tunable pipeline settings.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Debounce length for multi-page documents, in seconds. Every new page
    /// restarts the window.
    pub window_seconds: f64,

    /// Optional cap on the total batching wait, in seconds, measured from
    /// when the window first opened. Unset means a steady trickle of pages
    /// can hold a document in the window indefinitely.
    pub max_window_seconds: Option<f64>,

    /// How long to wait between OCR coordinator invocations, in seconds.
    pub poll_interval_seconds: f64,

    /// Maximum OCR coordinator invocations per OCR episode before the
    /// document fails with `Timeout`.
    pub ocr_retry_limit: u32,

    /// Re-attempts for transient classification failures.
    pub classification_retry_limit: u8,

    /// Budget for OCR engine calls, such as `"10/s"`. Unset means one call
    /// per worker per second for engines that need a limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub ocr_rate_limit: Option<RateLimit>,

    /// Budget for classification requests, such as `"2000/m"`. Unset means
    /// no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub classification_rate_limit: Option<RateLimit>,

    /// Only object keys under this prefix are processed.
    pub intake_prefix: String,

    /// Where finished source files are moved.
    pub complete_prefix: String,

    /// PII stage settings.
    pub pii: PiiConfig,

    /// Directory of classification schemas (`*.json` or `*.toml`).
    pub schema_dir: Option<PathBuf>,

    /// Maps a classified `document_type` to the schema used for the
    /// specific extraction pass.
    pub schema_mapping: BTreeMap<String, String>,

    /// The classification model.
    pub model: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_seconds: 3.0,
            max_window_seconds: None,
            poll_interval_seconds: 5.0,
            ocr_retry_limit: 60,
            classification_retry_limit: 5,
            ocr_rate_limit: None,
            classification_rate_limit: None,
            intake_prefix: "incoming/".to_owned(),
            complete_prefix: "complete/".to_owned(),
            pii: PiiConfig::default(),
            schema_dir: None,
            schema_mapping: default_schema_mapping(),
            model: "gpt-4o-mini".to_owned(),
        }
    }
}

impl PipelineConfig {
    /// Load a config file. The format is chosen by extension.
    pub async fn load(path: &Path) -> Result<Self> {
        let config = read_json_or_toml::<Self>(path).await?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the pipeline misbehave.
    pub fn validate(&self) -> Result<()> {
        if !(self.window_seconds.is_finite() && self.window_seconds >= 0.0) {
            return Err(anyhow!("window_seconds must be a non-negative number"));
        }
        if let Some(max) = self.max_window_seconds
            && !(max.is_finite() && max >= self.window_seconds)
        {
            return Err(anyhow!(
                "max_window_seconds must be at least window_seconds"
            ));
        }
        if !(self.poll_interval_seconds.is_finite() && self.poll_interval_seconds > 0.0) {
            return Err(anyhow!("poll_interval_seconds must be positive"));
        }
        if self.ocr_retry_limit == 0 {
            return Err(anyhow!("ocr_retry_limit must be at least 1"));
        }
        Ok(())
    }

    /// The debounce window.
    pub fn window(&self) -> TimeDelta {
        seconds(self.window_seconds)
    }

    /// The cap on total batching wait, if any.
    pub fn max_window(&self) -> Option<TimeDelta> {
        self.max_window_seconds.map(seconds)
    }

    /// The OCR poll interval.
    pub fn poll_interval(&self) -> TimeDelta {
        seconds(self.poll_interval_seconds)
    }
}

/// Settings for the optional PII stage.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PiiConfig {
    /// Run the PII stage at all?
    pub enabled: bool,

    /// Only run for documents from these source locations. Empty means all.
    pub source_locations: Vec<String>,

    /// Fail the document if the PII stage fails.
    pub mandatory: bool,

    /// Send redacted text to classification when PII detection succeeded.
    pub redact_before_classification: bool,
}

impl Default for PiiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source_locations: vec![],
            mandatory: false,
            redact_before_classification: true,
        }
    }
}

impl PiiConfig {
    /// Should documents from `source_location` go through the PII stage?
    pub fn applies_to(&self, source_location: &str) -> bool {
        self.enabled
            && (self.source_locations.is_empty()
                || self.source_locations.iter().any(|s| s == source_location))
    }
}

/// Which extraction schema to use for each classified document type.
fn default_schema_mapping() -> BTreeMap<String, String> {
    [
        ("promotion", "banking"),
        ("invoice", "invoice"),
        ("banking", "banking"),
        ("credit_card", "credit_cards"),
        ("insurance", "insurance"),
        ("receipt", "invoice"),
        ("contract", "invoice"),
        ("letter", "invoice"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v.to_owned()))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
window_seconds = 1.5

[pii]
enabled = true
source_locations = ["docproc-uploads"]
"#,
        )
        .unwrap();
        assert_eq!(config.window(), TimeDelta::milliseconds(1500));
        assert_eq!(config.ocr_retry_limit, 60);
        assert_eq!(config.intake_prefix, "incoming/");
        assert!(config.pii.redact_before_classification);
        assert!(config.pii.applies_to("docproc-uploads"));
        assert!(!config.pii.applies_to("elsewhere"));
        assert_eq!(config.schema_mapping["receipt"], "invoice");
        config.validate().unwrap();
    }

    #[test]
    fn test_rate_limits_from_file() {
        let config: PipelineConfig = toml::from_str(
            r#"
ocr_rate_limit = "10/s"
classification_rate_limit = "600/min"
"#,
        )
        .unwrap();
        assert_eq!(config.ocr_rate_limit, Some(RateLimit::per_second(10)));
        assert_eq!(
            config.classification_rate_limit.unwrap().to_string(),
            "600/m"
        );
        assert!(toml::from_str::<PipelineConfig>(r#"ocr_rate_limit = "0/s""#).is_err());

        let schema = serde_json::to_value(schemars::schema_for!(PipelineConfig)).unwrap();
        assert_eq!(
            schema["properties"]["ocr_rate_limit"]["type"],
            json!(["string", "null"])
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(toml::from_str::<PipelineConfig>("windw_seconds = 3").is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = PipelineConfig {
            max_window_seconds: Some(1.0),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
        config.max_window_seconds = Some(30.0);
        config.validate().unwrap();
        config.ocr_retry_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pii_disabled_applies_nowhere() {
        let pii = PiiConfig::default();
        assert!(!pii.applies_to("anything"));
    }
}
