//! Combine per-page OCR text into one document.

use crate::{
    model::DocumentStatus,
    objects::layout,
    pipeline::{Pipeline, Stage, StepOutcome},
    prelude::*,
};

/// Join page texts in page order. `pages` need not be sorted.
pub fn combine_pages(pages: &[(u32, String)]) -> String {
    let mut sorted = pages.iter().collect::<Vec<_>>();
    sorted.sort_by_key(|(index, _)| *index);
    let mut combined = String::new();
    for (index, text) in sorted {
        combined.push_str(&format!("--- Page {index} ---\n{text}\n\n"));
    }
    combined
}

/// The scheduler's entry point for [`Stage::Aggregate`].
///
/// Reads the text of every OCRed page, writes the combined text, and moves
/// the document to PII detection or classification. Running it twice on the
/// same record writes the same bytes.
#[instrument(level = "debug", skip_all, fields(document_id = %document_id))]
pub async fn aggregate_text(
    pipeline: &Pipeline,
    document_id: &str,
) -> Result<StepOutcome, PipelineError> {
    let doc = pipeline.load(document_id).await?;
    if doc.status != DocumentStatus::Aggregating {
        return Err(PipelineError::stale(format!(
            "expected AGGREGATING, found {}",
            doc.status
        )));
    }

    let mut pages = vec![];
    for page in doc.ocr_pages() {
        let text_ref = doc.ocr_text_refs.get(&page.location).ok_or_else(|| {
            PipelineError::new(
                ErrKind::Unknown,
                format!("page {} of {document_id} has no OCR text", page.index),
            )
        })?;
        let text = pipeline.objects.get_text(text_ref).await?;
        pages.push((page.index, text));
    }
    let combined = combine_pages(&pages);
    let combined_ref = layout::combined_text(document_id);
    pipeline.objects.put_text(&combined_ref, &combined).await?;

    let (next_status, next_stage) = if pipeline.config.pii.applies_to(&doc.source_location) {
        (DocumentStatus::PiiProcessing, Stage::Pii)
    } else {
        (DocumentStatus::LlmRunning, Stage::Classify)
    };
    pipeline
        .store
        .conditional_transition(
            document_id,
            DocumentStatus::Aggregating,
            next_status,
            Box::new(move |doc| {
                doc.combined_text_ref = Some(combined_ref);
                Ok(())
            }),
        )
        .await?;
    info!(%document_id, pages = pages.len(), next = %next_status, "Text combined");
    Ok(StepOutcome::Next(next_stage))
}
