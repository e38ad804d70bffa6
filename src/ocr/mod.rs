//! The OCR job coordinator.
//!
//! Each invocation starts jobs for pending pages, polls running jobs, records
//! what changed, and reports whether the document is done, failed, or needs
//! another look later. The coordinator never waits for an engine; the
//! scheduler re-invokes it every `poll_interval`.

use futures::{StreamExt as _, stream};

use crate::{
    error::StoredError,
    model::{DocumentAggregate, DocumentStatus, OcrJob, OcrJobMode, OcrJobState, PageRef},
    objects::layout,
    pipeline::{Pipeline, Stage, StepOutcome},
    prelude::*,
};

use self::engines::{OcrPageRequest, OcrPoll, OcrSubmission};

pub mod engines;

/// How many pages of one document we talk to the engine about at once.
const PAGE_CONCURRENCY: usize = 8;

/// A change to one page's job.
#[derive(Debug)]
struct JobUpdate {
    location: String,
    /// The job as it was when we started. Only applied if still unchanged.
    before: Option<OcrJob>,
    after: OcrJob,
    text_ref: Option<String>,
}

/// The scheduler's entry point for [`Stage::Ocr`].
#[instrument(level = "debug", skip_all, fields(document_id = %document_id))]
pub async fn run_ocr_step(
    pipeline: &Pipeline,
    document_id: &str,
) -> Result<StepOutcome, PipelineError> {
    let doc = pipeline.load(document_id).await?;
    if doc.status != DocumentStatus::OcrRunning {
        return Err(PipelineError::stale(format!(
            "expected OCR_RUNNING, found {}",
            doc.status
        )));
    }
    let attempt = doc.ocr_attempts + 1;
    if attempt > pipeline.config.ocr_retry_limit {
        return Err(PipelineError::new(
            ErrKind::Timeout,
            format!(
                "OCR did not finish after {} attempts",
                pipeline.config.ocr_retry_limit
            ),
        ));
    }
    debug!(attempt, pages = doc.pages.len(), "Checking OCR jobs");

    let updates = advance_jobs(pipeline, &doc).await?;
    let after = match record_updates(pipeline, document_id, DocumentStatus::OcrRunning, &updates, true).await {
        Ok(after) => after,
        Err(err) if err.is_stale() => {
            // A new page re-opened the batching window. Keep what we
            // finished so the next OCR episode doesn't redo it.
            let current = pipeline.load(document_id).await?;
            if current.status == DocumentStatus::BatchingWindow && !updates.is_empty() {
                record_updates(pipeline, document_id, DocumentStatus::BatchingWindow, &updates, false)
                    .await?;
            }
            return Err(err);
        }
        Err(err) => return Err(err),
    };

    if let Some((page, job)) = first_failure(&after) {
        let stored = job.error.clone();
        let (kind, reason) = stored
            .map(|e| (e.kind, e.message))
            .unwrap_or((ErrKind::OcrJobFailed, "OCR failed".to_owned()));
        return Err(PipelineError::new(
            kind,
            format!("page {} ({}): {reason}", page.index, page.filename),
        ));
    }

    if after.all_ocr_succeeded() {
        return finish_ocr(pipeline, document_id).await;
    }
    Ok(StepOutcome::RetryAt(
        Stage::Ocr,
        pipeline.clock.now() + pipeline.config.poll_interval(),
    ))
}

/// Submit or poll every page that needs it.
async fn advance_jobs(
    pipeline: &Pipeline,
    doc: &DocumentAggregate,
) -> Result<Vec<JobUpdate>, PipelineError> {
    let page_count = doc.pages.len();
    let work = doc
        .pages_by_index()
        .into_iter()
        .filter(|page| {
            matches!(
                doc.ocr_state(page),
                OcrJobState::Pending | OcrJobState::AsyncStarted
            )
        })
        .map(|page| {
            let before = doc.ocr_jobs.get(&page.location).cloned();
            advance_job(pipeline, &doc.document_id, page, before, page_count)
        })
        .collect::<Vec<_>>();
    let results = stream::iter(work)
        .buffer_unordered(PAGE_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

    let mut updates = vec![];
    for result in results {
        if let Some(update) = result? {
            updates.push(update);
        }
    }
    Ok(updates)
}

/// Move one page's job forward. Engine trouble leaves the job as it was, so
/// the next invocation tries again.
#[instrument(level = "debug", skip_all, fields(page = %page.index))]
async fn advance_job(
    pipeline: &Pipeline,
    document_id: &str,
    page: &PageRef,
    before: Option<OcrJob>,
    page_count: usize,
) -> Result<Option<JobUpdate>, PipelineError> {
    let mut job = before.clone().unwrap_or_else(|| OcrJob {
        page_index: page.index,
        ..OcrJob::default()
    });
    let now = pipeline.clock.now();

    let text = match (job.state, job.job_id.clone()) {
        (OcrJobState::AsyncStarted, Some(job_id)) => match pipeline.ocr.poll(&job_id).await {
            Ok(OcrPoll::Running) => {
                debug!(%job_id, "OCR job still running");
                return Ok(None);
            }
            Ok(OcrPoll::Succeeded { text }) => {
                job.state = OcrJobState::AsyncComplete;
                Some(text)
            }
            Ok(OcrPoll::Failed { kind, reason }) => {
                fail_job(&mut job, kind, reason, now);
                None
            }
            Err(err) => {
                warn!(%job_id, "Could not poll OCR job: {err:#}");
                return Ok(None);
            }
        },
        _ => {
            let data = pipeline.objects.get(&page.location).await?;
            let request = OcrPageRequest {
                document_id: document_id.to_owned(),
                page_index: page.index,
                location: page.location.clone(),
                page_count,
                data,
            };
            job.submitted_at = Some(now);
            match pipeline.ocr.submit(request).await {
                Ok(OcrSubmission::Completed { text }) => {
                    job.mode = Some(OcrJobMode::Sync);
                    job.state = OcrJobState::SyncComplete;
                    Some(text)
                }
                Ok(OcrSubmission::Started { job_id }) => {
                    debug!(%job_id, "Started OCR job");
                    job.mode = Some(OcrJobMode::Async);
                    job.job_id = Some(job_id);
                    job.state = OcrJobState::AsyncStarted;
                    None
                }
                Ok(OcrSubmission::Rejected { kind, reason }) => {
                    fail_job(&mut job, kind, reason, now);
                    None
                }
                Err(err) => {
                    warn!("Could not submit page for OCR: {err:#}");
                    return Ok(None);
                }
            }
        }
    };

    let text_ref = match text {
        Some(text) => {
            let location = layout::page_text(document_id, page.index);
            pipeline.objects.put_text(&location, &text).await?;
            job.finished_at = Some(now);
            debug!(bytes = text.len(), "Page OCR complete");
            Some(location)
        }
        None => None,
    };
    Ok(Some(JobUpdate {
        location: page.location.clone(),
        before,
        after: job,
        text_ref,
    }))
}

fn fail_job(job: &mut OcrJob, kind: ErrKind, reason: String, now: DateTime<Utc>) {
    warn!(page = job.page_index, %kind, "OCR failed: {reason}");
    job.state = OcrJobState::Failed;
    job.finished_at = Some(now);
    job.error = Some(StoredError::new(&PipelineError::new(kind, reason), "ocr", now));
}

/// Write job changes with a self-transition on `status`. A job that someone
/// else changed in the meantime is left alone.
async fn record_updates(
    pipeline: &Pipeline,
    document_id: &str,
    status: DocumentStatus,
    updates: &[JobUpdate],
    count_attempt: bool,
) -> Result<DocumentAggregate, PipelineError> {
    pipeline
        .store
        .conditional_transition(
            document_id,
            status,
            status,
            Box::new(move |doc| {
                if count_attempt {
                    doc.ocr_attempts += 1;
                }
                for update in updates {
                    if doc.ocr_jobs.get(&update.location) != update.before.as_ref() {
                        debug!(location = %update.location, "OCR job changed under us, skipping");
                        continue;
                    }
                    doc.ocr_jobs
                        .insert(update.location.clone(), update.after.clone());
                    if let Some(text_ref) = &update.text_ref {
                        doc.ocr_text_refs
                            .insert(update.location.clone(), text_ref.clone());
                    }
                }
                Ok(())
            }),
        )
        .await
}

/// The lowest-numbered page whose job failed.
fn first_failure(doc: &DocumentAggregate) -> Option<(&PageRef, &OcrJob)> {
    doc.pages_by_index().into_iter().find_map(|page| {
        doc.ocr_jobs
            .get(&page.location)
            .filter(|job| job.state == OcrJobState::Failed)
            .map(|job| (page, job))
    })
}

/// Every page has text. Hand the document to the aggregator.
async fn finish_ocr(pipeline: &Pipeline, document_id: &str) -> Result<StepOutcome, PipelineError> {
    let result = pipeline
        .store
        .conditional_transition(
            document_id,
            DocumentStatus::OcrRunning,
            DocumentStatus::Aggregating,
            Box::new(|doc| {
                if doc.all_ocr_succeeded() {
                    Ok(())
                } else {
                    Err(PipelineError::stale("a page without OCR text arrived"))
                }
            }),
        )
        .await;
    match result {
        Ok(doc) => {
            info!(%document_id, pages = doc.pages_received, "OCR complete");
            Ok(StepOutcome::Next(Stage::Aggregate))
        }
        Err(err) if err.is_stale() => {
            // If we are still the coordinator, pick up the new page right
            // away. Otherwise whoever moved the document owns it now.
            let current = pipeline.load(document_id).await?;
            if current.status == DocumentStatus::OcrRunning {
                Ok(StepOutcome::RetryAt(Stage::Ocr, pipeline.clock.now()))
            } else {
                Err(err)
            }
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::{
        batching::on_page_upserted,
        store::NewPage,
        test_support::{ScriptedOcr, TestHarness},
    };

    async fn add_page(h: &TestHarness, document_id: &str, index: u32) {
        let location = format!("incoming/{document_id}_{index}.jpg");
        h.pipeline
            .objects
            .put(&location, format!("image of page {index}").into_bytes())
            .await
            .unwrap();
        let outcome = h
            .pipeline
            .store
            .upsert_page(NewPage {
                document_id: document_id.to_owned(),
                page_index: index,
                location,
                filename: format!("{document_id}_{index}.jpg"),
                source_location: "uploads".to_owned(),
            })
            .await
            .unwrap();
        on_page_upserted(&h.pipeline, &outcome).await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_pages_finish_in_one_invocation() {
        let h = TestHarness::new();
        add_page(&h, "rcpt-9", 1).await;
        let outcome = run_ocr_step(&h.pipeline, "rcpt-9").await.unwrap();
        assert_eq!(outcome, StepOutcome::Next(Stage::Aggregate));
        let doc = h.doc("rcpt-9").await;
        assert_eq!(doc.status, DocumentStatus::Aggregating);
        let job = &doc.ocr_jobs["incoming/rcpt-9_1.jpg"];
        assert_eq!(job.mode, Some(OcrJobMode::Sync));
        assert_eq!(job.state, OcrJobState::SyncComplete);
        assert_eq!(
            h.pipeline
                .objects
                .get_text("staging/rcpt-9/text_page_1.txt")
                .await
                .unwrap(),
            "text of page 1"
        );
    }

    #[tokio::test]
    async fn test_async_jobs_are_polled_until_done() {
        let h = TestHarness::with_ocr(ScriptedOcr::asynchronous(2));
        add_page(&h, "inv-1", 1).await;

        // Submit, then one poll that is still running.
        let outcome = run_ocr_step(&h.pipeline, "inv-1").await.unwrap();
        let StepOutcome::RetryAt(Stage::Ocr, at) = outcome else {
            panic!("expected a retry, got {outcome:?}");
        };
        assert_eq!(at, h.clock.now() + TimeDelta::seconds(5));
        let doc = h.doc("inv-1").await;
        assert_eq!(doc.ocr_state(&doc.pages[0]), OcrJobState::AsyncStarted);

        h.clock.advance_to(at);
        let outcome = run_ocr_step(&h.pipeline, "inv-1").await.unwrap();
        assert!(matches!(outcome, StepOutcome::RetryAt(Stage::Ocr, _)));

        let outcome = run_ocr_step(&h.pipeline, "inv-1").await.unwrap();
        assert_eq!(outcome, StepOutcome::Next(Stage::Aggregate));
        let doc = h.doc("inv-1").await;
        assert_eq!(doc.ocr_jobs["incoming/inv-1_1.jpg"].state, OcrJobState::AsyncComplete);
        assert_eq!(doc.ocr_attempts, 3);
    }

    #[tokio::test]
    async fn test_rejected_page_fails_the_step() {
        let h = TestHarness::with_ocr(ScriptedOcr::rejecting(2, ErrKind::InvalidFileType));
        add_page(&h, "inv-1", 1).await;
        add_page(&h, "inv-1", 2).await;
        h.clock.advance(TimeDelta::seconds(5));
        crate::batching::fire_window(&h.pipeline, "inv-1").await.unwrap();

        let err = run_ocr_step(&h.pipeline, "inv-1").await.unwrap_err();
        assert_eq!(err.kind, ErrKind::InvalidFileType);
        let doc = h.doc("inv-1").await;
        assert_eq!(doc.ocr_jobs["incoming/inv-1_1.jpg"].state, OcrJobState::SyncComplete);
        assert_eq!(doc.ocr_jobs["incoming/inv-1_2.jpg"].state, OcrJobState::Failed);
        assert_eq!(doc.combined_text_ref, None);
    }

    #[tokio::test]
    async fn test_engine_outage_is_retried_then_times_out() {
        let h = TestHarness::with_ocr(ScriptedOcr::unavailable());
        add_page(&h, "inv-1", 1).await;
        let limit = h.pipeline.config.ocr_retry_limit;
        for _ in 0..limit {
            let outcome = run_ocr_step(&h.pipeline, "inv-1").await.unwrap();
            assert!(matches!(outcome, StepOutcome::RetryAt(Stage::Ocr, _)));
        }
        let err = run_ocr_step(&h.pipeline, "inv-1").await.unwrap_err();
        assert_eq!(err.kind, ErrKind::Timeout);
    }

    #[tokio::test]
    async fn test_missing_page_object_is_a_storage_error() {
        let h = TestHarness::new();
        let outcome = h
            .pipeline
            .store
            .upsert_page(NewPage {
                document_id: "ghost".to_owned(),
                page_index: 1,
                location: "incoming/ghost_1.jpg".to_owned(),
                filename: "ghost_1.jpg".to_owned(),
                source_location: "uploads".to_owned(),
            })
            .await
            .unwrap();
        on_page_upserted(&h.pipeline, &outcome).await.unwrap();
        let err = run_ocr_step(&h.pipeline, "ghost").await.unwrap_err();
        assert_eq!(err.kind, ErrKind::StorageAccessError);
    }

    #[tokio::test]
    async fn test_finished_jobs_survive_a_rearm() {
        let h = TestHarness::with_ocr(ScriptedOcr::asynchronous(1));
        add_page(&h, "inv-1", 1).await;
        run_ocr_step(&h.pipeline, "inv-1").await.unwrap();

        // Page 2 arrives while page 1's job is running.
        add_page(&h, "inv-1", 2).await;
        assert_eq!(h.doc("inv-1").await.status, DocumentStatus::BatchingWindow);
        let err = run_ocr_step(&h.pipeline, "inv-1").await.unwrap_err();
        assert!(err.is_stale());

        h.clock.advance(TimeDelta::seconds(3));
        assert!(crate::batching::fire_window(&h.pipeline, "inv-1").await.unwrap());
        let doc = h.doc("inv-1").await;
        assert_eq!(doc.ocr_attempts, 0);
        assert_eq!(doc.ocr_state(&doc.pages[0]), OcrJobState::AsyncStarted);
        assert_eq!(h.ocr().submissions(), 1);

        // Poll page 1 (done) and submit page 2.
        run_ocr_step(&h.pipeline, "inv-1").await.unwrap();
        let outcome = run_ocr_step(&h.pipeline, "inv-1").await.unwrap();
        assert_eq!(outcome, StepOutcome::Next(Stage::Aggregate));
        assert_eq!(h.ocr().submissions(), 2);
    }
}
