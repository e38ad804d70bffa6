//! A per-document processing timeline, derived from the record alone.
//!
//! Nothing here is stored. The timeline can be rebuilt from a
//! [`DocumentAggregate`] at any time.

use crate::{
    error::StoredError,
    model::{DocumentAggregate, DocumentStatus, PiiStatus},
    pipeline::Stage,
    prelude::*,
};

/// The steps shown on a timeline, in order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineStepName {
    Upload,
    Batching,
    Ocr,
    Aggregation,
    Pii,
    Classification,
    Finalize,
}

impl TimelineStepName {
    /// The stage whose errors belong to this step.
    fn stage(self) -> Option<Stage> {
        match self {
            TimelineStepName::Upload => None,
            TimelineStepName::Batching => Some(Stage::FireWindow),
            TimelineStepName::Ocr => Some(Stage::Ocr),
            TimelineStepName::Aggregation => Some(Stage::Aggregate),
            TimelineStepName::Pii => Some(Stage::Pii),
            TimelineStepName::Classification => Some(Stage::Classify),
            TimelineStepName::Finalize => Some(Stage::Finalize),
        }
    }
}

/// Where a step stands.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// One row of a timeline.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct TimelineStep {
    pub step: TimelineStepName,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Step-specific facts, such as page counts or the document type.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl TimelineStep {
    fn new(step: TimelineStepName, status: StepStatus) -> Self {
        Self {
            step,
            status,
            started_at: None,
            finished_at: None,
            details: Value::Null,
        }
    }

    fn started(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.started_at = at;
        self
    }

    fn finished(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.finished_at = at;
        self
    }

    fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// A document's processing history.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Timeline {
    pub document_id: String,
    pub status: DocumentStatus,
    pub steps: Vec<TimelineStep>,
}

impl Timeline {
    /// Build the timeline for `doc`.
    pub fn from_record(doc: &DocumentAggregate) -> Self {
        let mut steps = vec![
            upload_step(doc),
            batching_step(doc),
            ocr_step(doc),
            aggregation_step(doc),
            pii_step(doc),
            classification_step(doc),
            finalize_step(doc),
        ];
        if let Some(err) = failure(doc) {
            let failed_step = steps
                .iter()
                .position(|s| s.step.stage().is_some_and(|stage| stage.name() == err.stage));
            if let Some(position) = failed_step {
                let step = &mut steps[position];
                step.status = StepStatus::Failed;
                step.finished_at = Some(err.occurred_at);
                step.details = json!({
                    "error": err.kind,
                    "category": err.category,
                    "message": err.message,
                });
                for later in &mut steps[position + 1..] {
                    if later.status == StepStatus::Pending {
                        later.status = StepStatus::Skipped;
                    }
                }
            }
        }
        Self {
            document_id: doc.document_id.clone(),
            status: doc.status,
            steps,
        }
    }
}

fn failure(doc: &DocumentAggregate) -> Option<&StoredError> {
    if doc.status == DocumentStatus::Failed {
        doc.last_error.as_ref()
    } else {
        None
    }
}

/// Pending before the record reaches `status`, in progress while it is
/// there, and completed after.
fn status_progress(doc: &DocumentAggregate, status: DocumentStatus) -> StepStatus {
    if doc.status == status {
        StepStatus::InProgress
    } else if doc.status.rank() > status.rank() && doc.status != DocumentStatus::Failed {
        StepStatus::Completed
    } else {
        StepStatus::Pending
    }
}

fn upload_step(doc: &DocumentAggregate) -> TimelineStep {
    let last_arrival = doc.pages.iter().map(|p| p.received_at).max();
    TimelineStep::new(TimelineStepName::Upload, StepStatus::Completed)
        .started(Some(doc.created_at))
        .finished(last_arrival)
        .details(json!({
            "pages_received": doc.pages_received,
            "source_location": doc.source_location,
            "files": doc.pages_by_index().iter().map(|p| &p.filename).collect::<Vec<_>>(),
        }))
}

fn batching_step(doc: &DocumentAggregate) -> TimelineStep {
    let status = match (doc.status, doc.window_opened_at) {
        (DocumentStatus::AwaitingPages, _) => StepStatus::Pending,
        (DocumentStatus::BatchingWindow, _) => StepStatus::InProgress,
        // Single-page documents never open a window.
        (_, None) if doc.status != DocumentStatus::Failed => StepStatus::Skipped,
        (_, None) => StepStatus::Pending,
        (_, Some(_)) => StepStatus::Completed,
    };
    TimelineStep::new(TimelineStepName::Batching, status)
        .started(doc.window_opened_at)
        .details(match doc.window_expires_at {
            Some(expires_at) => json!({ "window_expires_at": expires_at }),
            None => Value::Null,
        })
}

fn ocr_step(doc: &DocumentAggregate) -> TimelineStep {
    let jobs = doc.ocr_jobs.values();
    let started = jobs.clone().filter_map(|j| j.submitted_at).min();
    let finished = if doc.all_ocr_terminal() && !doc.ocr_jobs.is_empty() {
        jobs.clone().filter_map(|j| j.finished_at).max()
    } else {
        None
    };
    let succeeded = jobs.clone().filter(|j| j.state.is_success()).count();
    TimelineStep::new(
        TimelineStepName::Ocr,
        status_progress(doc, DocumentStatus::OcrRunning),
    )
    .started(started)
    .finished(finished)
    .details(json!({
        "jobs": doc.ocr_jobs.len(),
        "succeeded": succeeded,
        "attempts": doc.ocr_attempts,
    }))
}

fn aggregation_step(doc: &DocumentAggregate) -> TimelineStep {
    let status = if doc.combined_text_ref.is_some() {
        StepStatus::Completed
    } else {
        status_progress(doc, DocumentStatus::Aggregating)
    };
    let step = TimelineStep::new(TimelineStepName::Aggregation, status);
    match &doc.combined_text_ref {
        Some(combined) => step.details(json!({ "combined_text_ref": combined })),
        None => step,
    }
}

fn pii_step(doc: &DocumentAggregate) -> TimelineStep {
    let Some(redaction) = &doc.redaction else {
        let status = if doc.status == DocumentStatus::PiiProcessing {
            StepStatus::InProgress
        } else if doc.combined_text_ref.is_some() {
            StepStatus::Skipped
        } else {
            StepStatus::Pending
        };
        return TimelineStep::new(TimelineStepName::Pii, status);
    };
    let status = match redaction.status {
        PiiStatus::PiiProcessing => StepStatus::InProgress,
        PiiStatus::PiiComplete => StepStatus::Completed,
        PiiStatus::PiiFailed => StepStatus::Failed,
    };
    TimelineStep::new(TimelineStepName::Pii, status)
        .started(Some(redaction.started_at))
        .finished(redaction.finished_at)
        .details(json!({
            "detected_types": redaction.detected_types,
            "total_detections": redaction.total_detections,
            "error": redaction.error.as_ref().map(|e| &e.message),
        }))
}

fn classification_step(doc: &DocumentAggregate) -> TimelineStep {
    if doc.classification_result_ref.is_some() {
        return TimelineStep::new(TimelineStepName::Classification, StepStatus::Completed)
            .details(json!({
                "document_type": doc.document_type,
                "result_ref": doc.classification_result_ref,
            }));
    }
    TimelineStep::new(
        TimelineStepName::Classification,
        status_progress(doc, DocumentStatus::LlmRunning),
    )
}

fn finalize_step(doc: &DocumentAggregate) -> TimelineStep {
    match doc.status {
        DocumentStatus::Complete => {
            TimelineStep::new(TimelineStepName::Finalize, StepStatus::Completed)
                .finished(Some(doc.updated_at))
                .details(json!({
                    "moved_files": doc.moved_files,
                    "warnings": doc.warnings.len(),
                }))
        }
        DocumentStatus::LlmRunning if doc.classification_result_ref.is_some() => {
            TimelineStep::new(TimelineStepName::Finalize, StepStatus::InProgress)
        }
        _ => TimelineStep::new(TimelineStepName::Finalize, StepStatus::Pending),
    }
}
