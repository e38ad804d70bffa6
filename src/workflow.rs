//! A local host for the pipeline.
//!
//! In production each stage invocation would be scheduled by an external
//! workflow service. Here a timed task queue plays that role: every stage
//! outcome either schedules the next stage now, schedules a retry for later,
//! or ends the document's run. Tasks carry nothing but a stage and a document
//! ID, so any task can be dropped and recreated from the store with
//! [`Workflow::resume_in_flight`].

use std::{cmp::Reverse, collections::BinaryHeap};

use futures::{StreamExt as _, stream};
use indicatif::ProgressBar;

use crate::{
    batching::{on_page_upserted, sweep_expired_windows},
    intake::{InboundEvent, IngestOutcome, ingest},
    model::DocumentStatus,
    pipeline::{Pipeline, Stage, StepOutcome},
    prelude::*,
    store::UpsertOutcome,
};

/// A stage invocation waiting for its time.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
struct Task {
    due: DateTime<Utc>,
    /// Keeps tasks due at the same instant in submission order.
    seq: u64,
    stage: Stage,
    document_id: String,
}

/// An inbound event we could not accept.
#[derive(Clone, Debug, Serialize)]
pub struct IntakeError {
    pub object_key: String,
    pub error: String,
    pub kind: ErrKind,
}

/// Counters from [`Workflow::run_until_idle`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunStats {
    /// Stage invocations.
    pub invocations: usize,
    /// Invocations that lost a race and retired.
    pub retired: usize,
    /// Documents that reached a terminal state.
    pub finished: usize,
}

/// Schedules stage invocations for many documents.
pub struct Workflow {
    pipeline: Pipeline,
    jobs: usize,
    queue: BinaryHeap<Reverse<Task>>,
    seq: u64,
    progress: Option<ProgressBar>,
}

impl Workflow {
    /// Create a host that runs up to `jobs` stage invocations at once.
    pub fn new(pipeline: Pipeline, jobs: usize) -> Self {
        Self {
            pipeline,
            jobs: jobs.max(1),
            queue: BinaryHeap::new(),
            seq: 0,
            progress: None,
        }
    }

    /// Tick `progress` each time a document finishes.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Number of scheduled tasks.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn schedule(&mut self, stage: Stage, document_id: &str, due: DateTime<Utc>) {
        trace!(%stage, %document_id, %due, "Scheduling");
        self.seq += 1;
        self.queue.push(Reverse(Task {
            due,
            seq: self.seq,
            stage,
            document_id: document_id.to_owned(),
        }));
    }

    fn schedule_outcome(&mut self, document_id: &str, outcome: &StepOutcome) {
        match outcome {
            StepOutcome::Next(stage) => self.schedule(*stage, document_id, self.pipeline.clock.now()),
            StepOutcome::RetryAt(stage, at) => self.schedule(*stage, document_id, *at),
            StepOutcome::Done | StepOutcome::Retired => {}
        }
    }

    /// Accept one inbound event, expanding archives into their pages.
    /// Events that can't be accepted are logged and returned; they never
    /// affect any document.
    pub async fn submit_event(&mut self, event: InboundEvent) -> Vec<IntakeError> {
        let mut errors = vec![];
        let mut events = vec![event];
        while let Some(event) = events.pop() {
            match ingest(&self.pipeline, &event).await {
                Ok(IngestOutcome::Page {
                    document_id,
                    decision,
                    ..
                }) => {
                    if let Some(outcome) = decision.next_step() {
                        self.schedule_outcome(&document_id, &outcome);
                    }
                }
                Ok(IngestOutcome::Expanded { events: expanded }) => {
                    info!(archive = %event.object_key, pages = expanded.len(), "Expanded archive");
                    // Keep archive order.
                    events.extend(expanded.into_iter().rev());
                }
                Ok(IngestOutcome::Ignored { .. }) => {}
                Err(err) => {
                    warn!(object_key = %event.object_key, kind = %err.kind, "Rejected upload: {}", err.message);
                    errors.push(IntakeError {
                        object_key: event.object_key.clone(),
                        error: err.message,
                        kind: err.kind,
                    });
                }
            }
        }
        errors
    }

    /// Schedule work for every unfinished record in the store.
    #[instrument(level = "debug", skip_all)]
    pub async fn resume_in_flight(&mut self) -> Result<usize, PipelineError> {
        let now = self.pipeline.clock.now();
        let mut resumed = 0;
        for doc in self.pipeline.store.list().await? {
            if doc.status.is_terminal() {
                continue;
            }
            resumed += 1;
            if doc.status == DocumentStatus::AwaitingPages {
                // We stopped between recording the first page and deciding
                // how to batch. Decide now.
                let Some(newest) = doc.pages.iter().max_by_key(|p| p.received_at) else {
                    continue;
                };
                let upsert = UpsertOutcome {
                    created: doc.pages.len() == 1,
                    appended: true,
                    page_index: newest.index,
                    aggregate: doc.clone(),
                };
                let decision = on_page_upserted(&self.pipeline, &upsert).await?;
                if let Some(outcome) = decision.next_step() {
                    self.schedule_outcome(&doc.document_id, &outcome);
                }
                continue;
            }
            if let Some(stage) = Stage::for_status(doc.status) {
                let due = match doc.window_expires_at {
                    Some(expires_at) if stage == Stage::FireWindow => expires_at,
                    _ => now,
                };
                debug!(document_id = %doc.document_id, %stage, "Resuming");
                self.schedule(stage, &doc.document_id, due);
            }
        }
        if resumed > 0 {
            info!(resumed, "Resumed unfinished documents");
        }
        Ok(resumed)
    }

    /// Run tasks as they come due until there is nothing left to do.
    ///
    /// When the queue empties we also sweep for expired windows, which
    /// catches windows armed by other processes.
    pub async fn run_until_idle(&mut self) -> Result<RunStats, PipelineError> {
        let mut stats = RunStats::default();
        loop {
            let Some(due) = self.queue.peek().map(|Reverse(task)| task.due) else {
                let fired = sweep_expired_windows(&self.pipeline).await?;
                if fired.is_empty() {
                    break;
                }
                let now = self.pipeline.clock.now();
                for document_id in fired {
                    self.schedule(Stage::Ocr, &document_id, now);
                }
                continue;
            };
            self.pipeline.clock.sleep_until(due).await;

            let now = self.pipeline.clock.now();
            let mut batch = vec![];
            while batch.len() < self.jobs
                && self.queue.peek().is_some_and(|Reverse(task)| task.due <= now)
            {
                if let Some(Reverse(task)) = self.queue.pop() {
                    batch.push(task);
                }
            }

            let pipeline = self.pipeline.clone();
            let pipeline = &pipeline;
            let results = stream::iter(batch)
                .map(|task| async move {
                    let result = pipeline.run_stage(task.stage, &task.document_id).await;
                    (task, result)
                })
                .buffer_unordered(self.jobs)
                .collect::<Vec<_>>()
                .await;

            for (task, result) in results {
                stats.invocations += 1;
                match result {
                    Ok(StepOutcome::Retired) => stats.retired += 1,
                    Ok(StepOutcome::Done) => {
                        stats.finished += 1;
                        if let Some(progress) = &self.progress {
                            progress.inc(1);
                        }
                    }
                    Ok(outcome) => self.schedule_outcome(&task.document_id, &outcome),
                    Err(err) => {
                        // We could not even record the failure. Leave the
                        // record as it is for the next resume.
                        error!(
                            document_id = %task.document_id,
                            stage = %task.stage,
                            "Could not run stage: {err}"
                        );
                    }
                }
            }
        }
        Ok(stats)
    }
}
