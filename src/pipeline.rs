//! The shared context every stage runs with, and the vocabulary stages use to
//! tell the scheduler what should happen next.

use std::fmt;

use crate::{
    classify::drivers::Classifier,
    clock::Clock,
    config::PipelineConfig,
    error::StoredError,
    model::{DocumentAggregate, DocumentStatus},
    objects::ObjectStore,
    ocr::engines::OcrEngine,
    prelude::*,
    schema::SchemaSet,
    store::{DocumentStore, not_found},
};

/// Everything a stage invocation needs. Stages keep no state of their own
/// between invocations; anything that must survive lives in the store.
#[derive(Clone)]
pub struct Pipeline {
    pub store: Arc<dyn DocumentStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub ocr: Arc<dyn OcrEngine>,
    pub classifier: Arc<dyn Classifier>,
    pub schemas: Arc<SchemaSet>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<PipelineConfig>,
}

/// A unit of work the scheduler can invoke for a document.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Stage {
    /// Move an expired batching window on to OCR.
    FireWindow,
    /// Start and poll per-page OCR jobs.
    Ocr,
    /// Combine page text.
    Aggregate,
    /// Detect and mask personal information.
    Pii,
    /// Run schema-driven classification.
    Classify,
    /// Move source files and mark the document complete.
    Finalize,
}

impl Stage {
    /// The status a document must have for this stage to act on it.
    pub fn expected_status(self) -> DocumentStatus {
        match self {
            Stage::FireWindow => DocumentStatus::BatchingWindow,
            Stage::Ocr => DocumentStatus::OcrRunning,
            Stage::Aggregate => DocumentStatus::Aggregating,
            Stage::Pii => DocumentStatus::PiiProcessing,
            Stage::Classify | Stage::Finalize => DocumentStatus::LlmRunning,
        }
    }

    /// The stage that should run for a document in `status`, used when
    /// resuming work after a restart.
    pub fn for_status(status: DocumentStatus) -> Option<Stage> {
        match status {
            DocumentStatus::BatchingWindow => Some(Stage::FireWindow),
            DocumentStatus::OcrRunning => Some(Stage::Ocr),
            DocumentStatus::Aggregating => Some(Stage::Aggregate),
            DocumentStatus::PiiProcessing => Some(Stage::Pii),
            DocumentStatus::LlmRunning => Some(Stage::Classify),
            DocumentStatus::AwaitingPages
            | DocumentStatus::Complete
            | DocumentStatus::Failed => None,
        }
    }

    /// The name recorded in errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            Stage::FireWindow => "batching",
            Stage::Ocr => "ocr",
            Stage::Aggregate => "aggregation",
            Stage::Pii => "pii",
            Stage::Classify => "classification",
            Stage::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a stage invocation wants to happen next.
#[derive(Clone, Debug, PartialEq)]
pub enum StepOutcome {
    /// Run another stage right away.
    Next(Stage),
    /// Run a stage again (or for the first time) at a later time.
    RetryAt(Stage, DateTime<Utc>),
    /// The document reached a terminal state.
    Done,
    /// Someone else owns the document now. Nothing to do.
    Retired,
}

impl Pipeline {
    /// Run one stage for one document, turning errors into outcomes.
    pub async fn run_stage(
        &self,
        stage: Stage,
        document_id: &str,
    ) -> Result<StepOutcome, PipelineError> {
        let result = match stage {
            Stage::FireWindow => crate::batching::fire_window_step(self, document_id).await,
            Stage::Ocr => crate::ocr::run_ocr_step(self, document_id).await,
            Stage::Aggregate => crate::aggregate::aggregate_text(self, document_id).await,
            Stage::Pii => crate::pii::run_pii_stage(self, document_id).await,
            Stage::Classify => crate::classify::classify_document(self, document_id).await,
            Stage::Finalize => crate::finalize::finalize_document(self, document_id).await,
        };
        self.conclude(stage, document_id, result).await
    }

    /// Settle a stage result. Lost races retire quietly; real errors fail
    /// the document.
    pub async fn conclude(
        &self,
        stage: Stage,
        document_id: &str,
        result: Result<StepOutcome, PipelineError>,
    ) -> Result<StepOutcome, PipelineError> {
        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) if err.is_stale() => {
                debug!(%document_id, %stage, "Retiring stale invocation: {}", err.message);
                Ok(StepOutcome::Retired)
            }
            Err(err) => match self.fail_document(document_id, stage, &err).await {
                Ok(()) => Ok(StepOutcome::Done),
                Err(fail_err) if fail_err.is_stale() => {
                    debug!(%document_id, %stage, "Document moved on before failure was recorded");
                    Ok(StepOutcome::Retired)
                }
                Err(fail_err) => Err(fail_err),
            },
        }
    }

    /// Move a document to `FAILED`, recording `err`.
    #[instrument(level = "debug", skip_all, fields(document_id = %document_id, stage = %stage))]
    pub async fn fail_document(
        &self,
        document_id: &str,
        stage: Stage,
        err: &PipelineError,
    ) -> Result<(), PipelineError> {
        let stored = StoredError::new(err, stage.name(), self.clock.now());
        error!(
            %document_id,
            %stage,
            kind = %err.kind,
            category = %stored.category,
            "Document failed: {}",
            err.message,
        );
        self.store
            .conditional_transition(
                document_id,
                stage.expected_status(),
                DocumentStatus::Failed,
                Box::new(move |doc| {
                    doc.last_error = Some(stored);
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    /// Fetch a record that must exist.
    pub async fn load(
        &self,
        document_id: &str,
    ) -> Result<DocumentAggregate, PipelineError> {
        self.store
            .get(document_id)
            .await?
            .ok_or_else(|| not_found(document_id))
    }
}
