//! The event normalizer: turns uploaded objects into pages of documents.

use crate::{
    batching::{BatchDecision, on_page_upserted},
    config::PipelineConfig,
    pipeline::Pipeline,
    prelude::*,
    store::NewPage,
};

pub mod archive;
pub mod event;
pub mod filename;

pub use self::event::{InboundEvent, parse_events};
use self::filename::{parse_page_filename, supported_mime_for_extension};

/// What an inbound event turned out to be.
#[derive(Clone, Debug, PartialEq)]
pub enum Intake {
    /// A page of a document.
    Page(NewPage),
    /// A zip archive to expand.
    Archive { location: String },
    /// Something we don't process, such as our own output files.
    Ignored { reason: String },
}

/// Classify an inbound event without touching any storage.
///
/// Filenames with no page number fail with `InvalidFilename`, and
/// unsupported extensions with `InvalidFileType`. Neither creates a record.
pub fn normalize(event: &InboundEvent, config: &PipelineConfig) -> Result<Intake, PipelineError> {
    if !event.object_key.starts_with(&config.intake_prefix) {
        return Ok(Intake::Ignored {
            reason: format!(
                "{} is outside the intake prefix {:?}",
                event.object_key, config.intake_prefix
            ),
        });
    }
    let filename = event.filename();
    if filename.is_empty() {
        return Ok(Intake::Ignored {
            reason: format!("{} is a folder", event.object_key),
        });
    }
    if filename.to_ascii_lowercase().ends_with(".zip") {
        return Ok(Intake::Archive {
            location: event.object_key.clone(),
        });
    }

    let name = parse_page_filename(filename)?;
    supported_mime_for_extension(&name.extension)?;
    Ok(Intake::Page(NewPage {
        document_id: name.document_id,
        page_index: name.page_index,
        location: event.object_key.clone(),
        filename: filename.to_owned(),
        source_location: event.source_location.clone(),
    }))
}

/// What happened to an inbound event.
#[derive(Clone, Debug, PartialEq)]
pub enum IngestOutcome {
    /// A page was recorded.
    Page {
        document_id: String,
        page_index: u32,
        decision: BatchDecision,
    },
    /// An archive was expanded into these new events.
    Expanded { events: Vec<InboundEvent> },
    /// Nothing to do.
    Ignored { reason: String },
}

/// Process one inbound event: record the page and make the batching decision.
#[instrument(level = "debug", skip_all, fields(object_key = %event.object_key))]
pub async fn ingest(
    pipeline: &Pipeline,
    event: &InboundEvent,
) -> Result<IngestOutcome, PipelineError> {
    match normalize(event, &pipeline.config)? {
        Intake::Page(page) => {
            let document_id = page.document_id.clone();
            let page_index = page.page_index;
            let outcome = pipeline.store.upsert_page(page).await?;
            let decision = on_page_upserted(pipeline, &outcome).await?;
            debug!(%document_id, page = page_index, ?decision, "Page ingested");
            Ok(IngestOutcome::Page {
                document_id,
                page_index,
                decision,
            })
        }
        Intake::Archive { location } => {
            let events = archive::expand_archive(
                pipeline.objects.as_ref(),
                &pipeline.config.intake_prefix,
                &event.source_location,
                &location,
                pipeline.clock.now(),
            )
            .await?;
            Ok(IngestOutcome::Expanded { events })
        }
        Intake::Ignored { reason } => {
            debug!("Ignoring event: {reason}");
            Ok(IngestOutcome::Ignored { reason })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::DocumentStatus, test_support::TestHarness};

    fn event(key: &str) -> InboundEvent {
        InboundEvent {
            source_location: "uploads".to_owned(),
            object_key: key.to_owned(),
            event_time: None,
        }
    }

    #[test]
    fn test_normalize_page() {
        let config = PipelineConfig::default();
        let Intake::Page(page) = normalize(&event("incoming/inv-1_2.jpg"), &config).unwrap()
        else {
            panic!("expected a page");
        };
        assert_eq!(page.document_id, "inv-1");
        assert_eq!(page.page_index, 2);
        assert_eq!(page.location, "incoming/inv-1_2.jpg");
        assert_eq!(page.filename, "inv-1_2.jpg");
    }

    #[test]
    fn test_normalize_other_prefixes_and_archives() {
        let config = PipelineConfig::default();
        assert!(matches!(
            normalize(&event("results/inv-1_response.json"), &config).unwrap(),
            Intake::Ignored { .. }
        ));
        assert!(matches!(
            normalize(&event("incoming/"), &config).unwrap(),
            Intake::Ignored { .. }
        ));
        assert_eq!(
            normalize(&event("incoming/batch.ZIP"), &config).unwrap(),
            Intake::Archive {
                location: "incoming/batch.ZIP".to_owned()
            }
        );
    }

    #[test]
    fn test_normalize_errors() {
        let config = PipelineConfig::default();
        let err = normalize(&event("incoming/invoice.jpg"), &config).unwrap_err();
        assert_eq!(err.kind, ErrKind::InvalidFilename);
        let err = normalize(&event("incoming/inv-1_1.gif"), &config).unwrap_err();
        assert_eq!(err.kind, ErrKind::InvalidFileType);
    }

    #[tokio::test]
    async fn test_bad_filename_creates_no_record() {
        let h = TestHarness::new();
        let err = ingest(&h.pipeline, &event("incoming/scan.pdf"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrKind::InvalidFilename);
        assert!(h.pipeline.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ingest_pages() {
        let h = TestHarness::new();
        let first = ingest(&h.pipeline, &event("incoming/rcpt-9_1.pdf"))
            .await
            .unwrap();
        assert_eq!(
            first,
            IngestOutcome::Page {
                document_id: "rcpt-9".to_owned(),
                page_index: 1,
                decision: BatchDecision::StartNow,
            }
        );
        let doc = h.doc("rcpt-9").await;
        assert_eq!(doc.status, DocumentStatus::OcrRunning);
        assert_eq!(doc.source_location, "uploads");
    }
}
