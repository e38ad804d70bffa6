//! Move source pages out of the intake area and complete the document.

use crate::{
    model::{DocumentStatus, WarningKind},
    objects::layout,
    pipeline::{Pipeline, StepOutcome},
    prelude::*,
};

/// The scheduler's entry point for [`Stage::Finalize`].
///
/// File moves are best effort. Pages that can't be moved stay where they are,
/// and the document still completes with a `partial_relocation` warning.
///
/// [`Stage::Finalize`]: crate::pipeline::Stage::Finalize
#[instrument(level = "debug", skip_all, fields(document_id = %document_id))]
pub async fn finalize_document(
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
    if doc.classification_result_ref.is_none() {
        return Err(PipelineError::new(
            ErrKind::Unknown,
            format!("{document_id} has no classification result to finalize"),
        ));
    }

    let mut moved = doc.moved_files.clone();
    let mut failures = vec![];
    for page in doc.pages_by_index() {
        let destination =
            layout::completed(&pipeline.config.complete_prefix, document_id, &page.filename);
        if moved.contains(&destination) {
            continue;
        }
        match pipeline
            .objects
            .move_object(&page.location, &destination)
            .await
        {
            Ok(()) => {
                debug!(from = %page.location, to = %destination, "Moved page");
                moved.push(destination);
            }
            Err(err) => {
                warn!(location = %page.location, "Could not move page: {}", err.message);
                failures.push(format!("{}: {}", page.location, err.message));
            }
        }
    }

    let now = pipeline.clock.now();
    let moved_count = moved.len();
    pipeline
        .store
        .conditional_transition(
            document_id,
            DocumentStatus::LlmRunning,
            DocumentStatus::Complete,
            Box::new(move |doc| {
                doc.moved_files = moved;
                if !failures.is_empty() {
                    doc.warn(
                        WarningKind::PartialRelocation,
                        format!(
                            "{} of {} files could not be moved: {}",
                            failures.len(),
                            doc.pages.len(),
                            failures.join("; ")
                        ),
                        now,
                    );
                }
                Ok(())
            }),
        )
        .await?;
    info!(%document_id, moved = moved_count, "Document complete");
    Ok(StepOutcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHarness;

    #[tokio::test]
    async fn test_moves_every_page() {
        let h = TestHarness::new();
        h.add_page("inv-1", 1).await;
        h.add_page("inv-1", 2).await;
        h.run_to(DocumentStatus::Complete, "inv-1").await;

        let doc = h.doc("inv-1").await;
        assert_eq!(
            doc.moved_files,
            vec!["complete/inv-1/inv-1_1.jpg", "complete/inv-1/inv-1_2.jpg"]
        );
        assert!(doc.warnings.is_empty());
        assert!(!h.objects().contains("incoming/inv-1_1.jpg"));
        assert!(h.objects().contains("complete/inv-1/inv-1_2.jpg"));
    }

    #[tokio::test]
    async fn test_partial_relocation_still_completes() {
        let h = TestHarness::new();
        h.add_page("inv-1", 1).await;
        h.add_page("inv-1", 2).await;
        h.run_to(DocumentStatus::LlmRunning, "inv-1").await;
        h.objects().deny("complete/inv-1/inv-1_2.jpg");
        h.run_to(DocumentStatus::Complete, "inv-1").await;

        let doc = h.doc("inv-1").await;
        assert_eq!(doc.status, DocumentStatus::Complete);
        assert_eq!(doc.moved_files, vec!["complete/inv-1/inv-1_1.jpg"]);
        assert_eq!(doc.warnings.len(), 1);
        assert_eq!(doc.warnings[0].kind, WarningKind::PartialRelocation);
        assert!(doc.warnings[0].message.contains("incoming/inv-1_2.jpg"));
        assert!(h.objects().contains("incoming/inv-1_2.jpg"));
    }

    #[tokio::test]
    async fn test_requires_classification() {
        let h = TestHarness::new();
        h.force_status("inv-1", DocumentStatus::LlmRunning, |_| {}).await;
        let err = finalize_document(&h.pipeline, "inv-1").await.unwrap_err();
        assert_eq!(err.kind, ErrKind::Unknown);
    }
}
