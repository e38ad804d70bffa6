//! Smart batching: decide when a document has all its pages.
//!
//! A brand-new document with one page goes straight to OCR. Every later page
//! (re)arms a debounce window, and the document only moves on once a full
//! window passes with no new arrivals. Windows are fired by
//! [`fire_window`], which re-checks the deadline inside the conditional
//! transition, so a page that sneaks in between the expiry check and the
//! write makes the trigger fail with `StaleTransition` instead of starting
//! OCR early.

use crate::{
    model::{DocumentAggregate, DocumentStatus, WarningKind},
    pipeline::{Pipeline, Stage, StepOutcome},
    prelude::*,
    store::UpsertOutcome,
};

/// How many times to re-read and retry when arming a window races with
/// other writers.
const ARM_ATTEMPTS: usize = 8;

/// What the controller decided for one page arrival.
#[derive(Clone, Debug, PartialEq)]
pub enum BatchDecision {
    /// The only page of a new document. OCR starts immediately.
    StartNow,
    /// The batching window now ends at `expires_at`.
    WindowArmed { expires_at: DateTime<Utc> },
    /// We already had this page.
    Duplicate,
    /// OCR had already finished. The page is recorded but not processed.
    Late { status: DocumentStatus },
}

impl BatchDecision {
    /// The scheduler step this decision calls for, if any.
    pub fn next_step(&self) -> Option<StepOutcome> {
        match self {
            BatchDecision::StartNow => Some(StepOutcome::Next(Stage::Ocr)),
            BatchDecision::WindowArmed { expires_at } => {
                Some(StepOutcome::RetryAt(Stage::FireWindow, *expires_at))
            }
            BatchDecision::Duplicate | BatchDecision::Late { .. } => None,
        }
    }
}

/// Decide what to do after a successful `upsert_page`.
#[instrument(
    level = "debug",
    skip_all,
    fields(document_id = %outcome.aggregate.document_id)
)]
pub async fn on_page_upserted(
    pipeline: &Pipeline,
    outcome: &UpsertOutcome,
) -> Result<BatchDecision, PipelineError> {
    if !outcome.appended {
        return Ok(BatchDecision::Duplicate);
    }
    let doc = &outcome.aggregate;

    if outcome.created && doc.pages.len() == 1 {
        let started = pipeline
            .store
            .conditional_transition(
                &doc.document_id,
                DocumentStatus::AwaitingPages,
                DocumentStatus::OcrRunning,
                Box::new(|doc| {
                    doc.ocr_attempts = 0;
                    Ok(())
                }),
            )
            .await;
        match started {
            Ok(_) => {
                info!(document_id = %doc.document_id, "Single page, starting OCR now");
                return Ok(BatchDecision::StartNow);
            }
            // Another page arrived first and has its own plans. Join them.
            Err(err) if err.is_stale() => {
                debug!("Fast path lost a race: {}", err.message);
            }
            Err(err) => return Err(err),
        }
    }

    arm_window(pipeline, &doc.document_id, outcome.page_index).await
}

/// Arm or re-arm the batching window, retrying if other writers get there
/// first.
async fn arm_window(
    pipeline: &Pipeline,
    document_id: &str,
    page_index: u32,
) -> Result<BatchDecision, PipelineError> {
    for _ in 0..ARM_ATTEMPTS {
        let current = pipeline.load(document_id).await?;
        let status = current.status;
        if status.is_past_ocr() {
            return record_late_page(pipeline, &current, page_index).await;
        }

        let now = pipeline.clock.now();
        let expires_at = window_deadline(pipeline, &current, now);
        let result = pipeline
            .store
            .conditional_transition(
                document_id,
                status,
                DocumentStatus::BatchingWindow,
                Box::new(move |doc| {
                    if doc.status != DocumentStatus::BatchingWindow {
                        doc.window_opened_at = Some(now);
                    }
                    if doc.status == DocumentStatus::OcrRunning {
                        // Finished page jobs are kept. The next OCR episode
                        // gets a fresh attempt budget.
                        doc.ocr_attempts = 0;
                    }
                    doc.window_expires_at = Some(expires_at);
                    Ok(())
                }),
            )
            .await;
        match result {
            Ok(_) => {
                if status == DocumentStatus::OcrRunning {
                    info!(%document_id, "New page during OCR, re-opening batching window");
                }
                info!(%document_id, %expires_at, "Batching window armed");
                return Ok(BatchDecision::WindowArmed { expires_at });
            }
            Err(err) if err.is_stale() => {
                debug!(%document_id, "Window arm lost a race: {}", err.message);
            }
            Err(err) => return Err(err),
        }
    }
    Err(PipelineError::new(
        ErrKind::Timeout,
        format!("could not arm batching window for {document_id} after {ARM_ATTEMPTS} attempts"),
    ))
}

/// When the window should end if a page arrives at `now`.
fn window_deadline(
    pipeline: &Pipeline,
    doc: &DocumentAggregate,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let deadline = now + pipeline.config.window();
    let Some(max_wait) = pipeline.config.max_window() else {
        return deadline;
    };
    let opened_at = match (doc.status, doc.window_opened_at) {
        (DocumentStatus::BatchingWindow, Some(opened_at)) => opened_at,
        _ => now,
    };
    // May already be in the past. The next sweep or FireWindow step fires it.
    deadline.min(opened_at + max_wait)
}

/// Note a page that arrived too late to be processed.
///
/// The OCR coordinator may have picked the page up anyway, if it loaded the
/// record after our upsert. Then there is nothing to warn about.
async fn record_late_page(
    pipeline: &Pipeline,
    doc: &DocumentAggregate,
    page_index: u32,
) -> Result<BatchDecision, PipelineError> {
    let status = doc.status;
    let Some(page) = doc.page(page_index) else {
        return Err(PipelineError::new(
            ErrKind::Unknown,
            format!("page {page_index} of {} vanished from the record", doc.document_id),
        ));
    };
    if doc.ocr_jobs.contains_key(&page.location) {
        debug!(
            document_id = %doc.document_id,
            page = page_index,
            "Page was OCR'd before its window could be armed"
        );
        return Ok(BatchDecision::Late { status });
    }
    let message = format!(
        "page {} arrived after OCR finished ({status}) and was not processed",
        page.filename
    );
    if status.is_terminal() {
        // Terminal records are never written again.
        warn!(document_id = %doc.document_id, "{message}");
        return Ok(BatchDecision::Late { status });
    }
    let now = pipeline.clock.now();
    let result = pipeline
        .store
        .conditional_transition(
            &doc.document_id,
            status,
            status,
            Box::new(move |doc| {
                doc.warn(WarningKind::LatePage, message, now);
                Ok(())
            }),
        )
        .await;
    match result {
        Ok(_) => Ok(BatchDecision::Late { status }),
        // The document moved on while we were writing. The page is stored
        // either way.
        Err(err) if err.is_stale() => Ok(BatchDecision::Late { status }),
        Err(err) => Err(err),
    }
}

/// Try to move an expired window on to OCR. Returns `false` if the window is
/// still open or someone else already fired it.
#[instrument(level = "debug", skip_all, fields(document_id = %document_id))]
pub async fn fire_window(pipeline: &Pipeline, document_id: &str) -> Result<bool, PipelineError> {
    let now = pipeline.clock.now();
    let result = pipeline
        .store
        .conditional_transition(
            document_id,
            DocumentStatus::BatchingWindow,
            DocumentStatus::OcrRunning,
            Box::new(move |doc| match doc.window_expires_at {
                Some(expires_at) if expires_at <= now => {
                    doc.ocr_attempts = 0;
                    Ok(())
                }
                Some(expires_at) => Err(PipelineError::stale(format!(
                    "window re-armed until {expires_at}"
                ))),
                None => Err(PipelineError::stale("no window deadline")),
            }),
        )
        .await;
    match result {
        Ok(doc) => {
            info!(pages = doc.pages_received, "Batching window expired, starting OCR");
            Ok(true)
        }
        Err(err) if err.is_stale() => {
            debug!("Window not fired: {}", err.message);
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// The scheduler's entry point for [`Stage::FireWindow`].
///
/// If the window was re-armed since this step was scheduled, the step
/// reschedules itself for the new deadline. This keeps a document from being
/// stranded if the re-arming writer never schedules its own step.
pub async fn fire_window_step(
    pipeline: &Pipeline,
    document_id: &str,
) -> Result<StepOutcome, PipelineError> {
    if fire_window(pipeline, document_id).await? {
        return Ok(StepOutcome::Next(Stage::Ocr));
    }
    let doc = pipeline.load(document_id).await?;
    match (doc.status, doc.window_expires_at) {
        (DocumentStatus::BatchingWindow, Some(expires_at)) => {
            Ok(StepOutcome::RetryAt(Stage::FireWindow, expires_at))
        }
        _ => Ok(StepOutcome::Retired),
    }
}

/// Fire every expired window. This is the periodic sweep that backs up the
/// per-document timers. Returns the documents that moved on to OCR.
#[instrument(level = "debug", skip_all)]
pub async fn sweep_expired_windows(pipeline: &Pipeline) -> Result<Vec<String>, PipelineError> {
    let now = pipeline.clock.now();
    let mut fired = vec![];
    for doc in pipeline
        .store
        .list_by_status(DocumentStatus::BatchingWindow)
        .await?
    {
        let expired = doc.window_expires_at.is_some_and(|at| at <= now);
        if expired && fire_window(pipeline, &doc.document_id).await? {
            fired.push(doc.document_id);
        }
    }
    Ok(fired)
}
