//! The classification stage.
//!
//! A `classification` pass finds the document type. If the type maps to a
//! loaded schema, a second `specific_extraction_<schema>` pass pulls out the
//! fields that schema describes. Both results go into one results document.

use keen_retry::ExponentialJitter;
use serde_json::Map;

use crate::{
    config::PipelineConfig,
    model::{DocumentAggregate, DocumentStatus, PiiStatus},
    objects::layout,
    pipeline::{Pipeline, Stage, StepOutcome},
    prelude::*,
    retry::{IntoRetryResult as _, retry_result_ok, try_with_retry_result},
    schema::CLASSIFICATION_SCHEMA,
};

use self::drivers::{ClassifyRequest, ClassifyRetryResult};

pub mod drivers;
pub mod prompt;

/// The scheduler's entry point for [`Stage::Classify`].
#[instrument(level = "debug", skip_all, fields(document_id = %document_id))]
pub async fn classify_document(
    pipeline: &Pipeline,
    document_id: &str,
) -> Result<StepOutcome, PipelineError> {
    let doc = pipeline.load(document_id).await?;
    if doc.status != DocumentStatus::LlmRunning {
        return Err(PipelineError::stale(format!(
            "expected LLM_RUNNING, found {}",
            doc.status
        )));
    }
    if doc.classification_result_ref.is_some() {
        debug!("Already classified");
        return Ok(StepOutcome::Next(Stage::Finalize));
    }

    let text_ref = classification_text_ref(&doc, &pipeline.config)?;
    let text = pipeline.objects.get_text(&text_ref).await?;

    let mut analysis = Map::new();
    let mut passes = vec![];

    let classification = run_pass(pipeline, CLASSIFICATION_SCHEMA, CLASSIFICATION_SCHEMA, &text).await?;
    let document_type = classification
        .get("document_type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_owned();
    analysis.insert(
        "classification".to_owned(),
        json!({ "success": true, "data": classification }),
    );
    passes.push(CLASSIFICATION_SCHEMA.to_owned());

    let schema_name = pipeline
        .config
        .schema_mapping
        .get(&document_type)
        .cloned()
        .unwrap_or_else(|| document_type.clone());
    if schema_name != CLASSIFICATION_SCHEMA && pipeline.schemas.contains(&schema_name) {
        let pass = format!("specific_extraction_{schema_name}");
        // The document type is already known, so a failed extraction is
        // recorded rather than failing the document.
        let result = match run_pass(pipeline, &pass, &schema_name, &text).await {
            Ok(data) => {
                passes.push(pass);
                json!({ "success": true, "schema": schema_name, "data": data })
            }
            Err(err) => {
                warn!(%pass, "Specific extraction failed: {}", err.message);
                json!({ "success": false, "schema": schema_name, "error": err.message })
            }
        };
        analysis.insert("specific_extraction".to_owned(), result);
    } else {
        debug!(%document_type, %schema_name, "No specific schema for document type");
    }

    let results = json!({
        "document_analysis": analysis,
        "processing_timestamp": pipeline.clock.now().to_rfc3339(),
        "schema_passes": passes,
        "text_source": text_ref,
    });
    let result_ref = layout::classification_result(document_id);
    pipeline.objects.put_json(&result_ref, &results).await?;

    let recorded_type = document_type.clone();
    pipeline
        .store
        .conditional_transition(
            document_id,
            DocumentStatus::LlmRunning,
            DocumentStatus::LlmRunning,
            Box::new(move |doc| {
                doc.classification_result_ref = Some(result_ref);
                doc.document_type = Some(recorded_type);
                Ok(())
            }),
        )
        .await?;
    info!(%document_id, %document_type, "Document classified");
    Ok(StepOutcome::Next(Stage::Finalize))
}

/// Which text to classify: the redacted text when PII detection succeeded
/// and redaction is on, otherwise the combined text.
fn classification_text_ref(
    doc: &DocumentAggregate,
    config: &PipelineConfig,
) -> Result<String, PipelineError> {
    if config.pii.redact_before_classification
        && let Some(redaction) = &doc.redaction
        && redaction.status == PiiStatus::PiiComplete
        && let Some(redacted) = &redaction.redacted_text_ref
    {
        return Ok(redacted.clone());
    }
    doc.combined_text_ref.clone().ok_or_else(|| {
        PipelineError::new(
            ErrKind::Unknown,
            format!("{} has no combined text to classify", doc.document_id),
        )
    })
}

/// Run one pass, retrying transient failures with exponential backoff.
#[instrument(level = "debug", skip_all, fields(pass = %pass))]
async fn run_pass(
    pipeline: &Pipeline,
    pass: &str,
    schema_name: &str,
    text: &str,
) -> Result<Value, PipelineError> {
    let schema = pipeline.schemas.get(schema_name).ok_or_else(|| {
        PipelineError::new(ErrKind::Unknown, format!("no schema named {schema_name}"))
    })?;
    let request = ClassifyRequest {
        pass,
        schema_name,
        schema,
        text,
    };

    // If we have a transient failure, back off exponentially.
    let jitter = ExponentialJitter::FromBackoffRange {
        backoff_range_millis: 1..=30_000,
        re_attempts: pipeline.config.classification_retry_limit,
        jitter_ratio: 0.2,
    };
    attempt_pass(pipeline, &request)
        .await
        .retry_with_async(|_| async { attempt_pass(pipeline, &request).await })
        .with_exponential_jitter(|| jitter)
        .await
        .inspect_fatal(|_, fatal_error| error!("{pass} FAILED with error {fatal_error:?}"))
        .inspect_recovered(|_, _, retry_errors_list| {
            warn!(
                "{pass} succeeded after retrying {} times (failed attempts: [{}])",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        })
        .inspect_given_up(|_, retry_errors_list, fatal_error| {
            error!(
                "{pass} FAILED after exhausting all {} retrying attempts with error {fatal_error:?}. Previous transient failures: [{}]",
                retry_errors_list.len(),
                keen_retry::loggable_retry_errors(retry_errors_list)
            )
        })
        .into_result()
        .map_err(|err| PipelineError::from_anyhow(ErrKind::ClassificationApiFailed, &err))
}

/// One attempt at a pass. A response that doesn't match the schema is
/// retried.
async fn attempt_pass(pipeline: &Pipeline, request: &ClassifyRequest<'_>) -> ClassifyRetryResult<Value> {
    let response = try_with_retry_result!(pipeline.classifier.classify(request).await);
    try_with_retry_result!(
        pipeline
            .schemas
            .validate(request.schema_name, &response)
            .into_transient()
    );
    retry_result_ok(response)
}
