//! Scripted engines and a wired-up pipeline for tests.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use chrono::TimeZone as _;

use crate::{
    batching::{BatchDecision, on_page_upserted},
    classify::drivers::{
        Classifier, ClassifyRequest, ClassifyRetryResult, echo::EchoClassifier,
    },
    clock::ManualClock,
    config::PipelineConfig,
    model::{DocumentAggregate, DocumentStatus, PageRef},
    objects::memory::MemoryObjectStore,
    ocr::engines::{OcrEngine, OcrPageRequest, OcrPoll, OcrSubmission},
    pipeline::{Pipeline, Stage, StepOutcome},
    prelude::*,
    retry::{retry_result_fatal, retry_result_ok},
    schema::SchemaSet,
    store::{DocumentStore as _, NewPage, memory::MemoryDocumentStore},
};

/// How a [`ScriptedOcr`] behaves.
#[derive(Clone, Debug)]
enum OcrScript {
    Synchronous,
    Asynchronous { polls: usize },
    Rejecting { page_index: u32, kind: ErrKind },
    Unavailable,
    FailingJobs,
}

/// An OCR engine that returns `text of page N` for page N.
#[derive(Debug)]
pub struct ScriptedOcr {
    script: OcrScript,
    submissions: AtomicUsize,
    /// Job ID to (polls so far, text).
    jobs: Mutex<HashMap<String, (usize, String)>>,
}

impl ScriptedOcr {
    fn new(script: OcrScript) -> Self {
        Self {
            script,
            submissions: AtomicUsize::new(0),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Every page completes on submission.
    pub fn synchronous() -> Self {
        Self::new(OcrScript::Synchronous)
    }

    /// Every page starts a job that succeeds on its `polls`th poll.
    pub fn asynchronous(polls: usize) -> Self {
        Self::new(OcrScript::Asynchronous { polls })
    }

    /// One page is rejected with `kind`; the rest complete synchronously.
    pub fn rejecting(page_index: u32, kind: ErrKind) -> Self {
        Self::new(OcrScript::Rejecting { page_index, kind })
    }

    /// Every call fails, as if the service were down.
    pub fn unavailable() -> Self {
        Self::new(OcrScript::Unavailable)
    }

    /// Jobs start, then fail when polled.
    pub fn failing_jobs() -> Self {
        Self::new(OcrScript::FailingJobs)
    }

    /// How many times `submit` was called.
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    fn start_job(&self, page: &OcrPageRequest) -> OcrSubmission {
        let job_id = format!("job-{}-{}", page.document_id, page.page_index);
        let text = format!("text of page {}", page.page_index);
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.clone(), (0, text));
        OcrSubmission::Started { job_id }
    }
}

#[async_trait]
impl OcrEngine for ScriptedOcr {
    async fn submit(&self, page: OcrPageRequest) -> Result<OcrSubmission> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let completed = OcrSubmission::Completed {
            text: format!("text of page {}", page.page_index),
        };
        match &self.script {
            OcrScript::Synchronous => Ok(completed),
            OcrScript::Asynchronous { .. } | OcrScript::FailingJobs => Ok(self.start_job(&page)),
            OcrScript::Rejecting { page_index, kind } if *page_index == page.page_index => {
                Ok(OcrSubmission::Rejected {
                    kind: *kind,
                    reason: "UnsupportedDocumentException: unsupported document format".to_owned(),
                })
            }
            OcrScript::Rejecting { .. } => Ok(completed),
            OcrScript::Unavailable => Err(anyhow!("OCR service unavailable")),
        }
    }

    async fn poll(&self, job_id: &str) -> Result<OcrPoll> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let (polls, text) = jobs
            .get_mut(job_id)
            .ok_or_else(|| anyhow!("no such job {job_id}"))?;
        *polls += 1;
        match &self.script {
            OcrScript::Asynchronous { polls: needed } if *polls >= *needed => {
                Ok(OcrPoll::Succeeded { text: text.clone() })
            }
            OcrScript::FailingJobs => Ok(OcrPoll::Failed {
                kind: ErrKind::OcrJobFailed,
                reason: format!("job {job_id} FAILED"),
            }),
            _ => Ok(OcrPoll::Running),
        }
    }
}

/// A classifier with canned answers per schema. Schemas without an answer
/// get what the echo classifier would return.
#[derive(Debug, Default)]
pub struct ScriptedClassifier {
    answers: BTreeMap<String, Value>,
    failure: Option<String>,
    texts: Mutex<Vec<String>>,
}

impl ScriptedClassifier {
    /// Answer with `answers[schema_name]`.
    pub fn answering(answers: Value) -> Self {
        let answers = answers
            .as_object()
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Self {
            answers,
            ..Self::default()
        }
    }

    /// Fail every call with a non-retryable error.
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_owned()),
            ..Self::default()
        }
    }

    /// The text of every request, in order.
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, request: &ClassifyRequest<'_>) -> ClassifyRetryResult<Value> {
        self.texts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.text.to_owned());
        if let Some(message) = &self.failure {
            return retry_result_fatal(anyhow!("{message}"));
        }
        match self.answers.get(request.schema_name) {
            Some(answer) => retry_result_ok(answer.clone()),
            None => EchoClassifier.classify(request).await,
        }
    }
}

/// A pipeline over in-memory stores and scripted engines, driven by a
/// manual clock.
pub struct TestHarness {
    pub pipeline: Pipeline,
    pub clock: Arc<ManualClock>,
    store: Arc<MemoryDocumentStore>,
    objects: Arc<MemoryObjectStore>,
    ocr: Arc<ScriptedOcr>,
    classifier: Arc<ScriptedClassifier>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self::build(
            config,
            ScriptedOcr::synchronous(),
            ScriptedClassifier::default(),
            SchemaSet::builtin().unwrap(),
        )
    }

    pub fn with_ocr(ocr: ScriptedOcr) -> Self {
        Self::build(
            PipelineConfig::default(),
            ocr,
            ScriptedClassifier::default(),
            SchemaSet::builtin().unwrap(),
        )
    }

    pub fn with_classifier(classifier: ScriptedClassifier) -> Self {
        Self::build(
            PipelineConfig::default(),
            ScriptedOcr::synchronous(),
            classifier,
            SchemaSet::builtin().unwrap(),
        )
    }

    pub fn build(
        config: PipelineConfig,
        ocr: ScriptedOcr,
        classifier: ScriptedClassifier,
        schemas: SchemaSet,
    ) -> Self {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(MemoryDocumentStore::new(clock.clone()));
        let objects = Arc::new(MemoryObjectStore::new());
        let ocr = Arc::new(ocr);
        let classifier = Arc::new(classifier);
        let pipeline = Pipeline {
            store: store.clone(),
            objects: objects.clone(),
            ocr: ocr.clone(),
            classifier: classifier.clone(),
            schemas: Arc::new(schemas),
            clock: clock.clone(),
            config: Arc::new(config),
        };
        Self {
            pipeline,
            clock,
            store,
            objects,
            ocr,
            classifier,
        }
    }

    pub fn ocr(&self) -> &ScriptedOcr {
        &self.ocr
    }

    pub fn classifier(&self) -> &ScriptedClassifier {
        &self.classifier
    }

    pub fn objects(&self) -> &MemoryObjectStore {
        &self.objects
    }

    /// Fetch a record that must exist.
    pub async fn doc(&self, document_id: &str) -> DocumentAggregate {
        self.store
            .get(document_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no record for {document_id}"))
    }

    /// Upload `incoming/<document_id>_<index>.jpg` and make the batching
    /// decision for it.
    pub async fn add_page(&self, document_id: &str, index: u32) -> BatchDecision {
        let filename = format!("{document_id}_{index}.jpg");
        let location = format!("incoming/{filename}");
        self.pipeline
            .objects
            .put(&location, format!("image of page {index}").into_bytes())
            .await
            .unwrap();
        let outcome = self
            .pipeline
            .store
            .upsert_page(NewPage {
                document_id: document_id.to_owned(),
                page_index: index,
                location,
                filename,
                source_location: "uploads".to_owned(),
            })
            .await
            .unwrap();
        on_page_upserted(&self.pipeline, &outcome).await.unwrap()
    }

    /// Overwrite a record's status directly, creating a one-page record if
    /// needed, then apply `edit`.
    pub async fn force_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        edit: impl FnOnce(&mut DocumentAggregate),
    ) {
        let now = self.clock.now();
        let mut doc = self.store.get(document_id).await.unwrap().unwrap_or_else(|| {
            let mut doc = DocumentAggregate::new(document_id, "uploads", now);
            doc.pages.push(PageRef {
                index: 1,
                location: format!("incoming/{document_id}_1.jpg"),
                filename: format!("{document_id}_1.jpg"),
                received_at: now,
            });
            doc.pages_received = 1;
            doc
        });
        doc.status = status;
        doc.window_expires_at = (status == DocumentStatus::BatchingWindow).then_some(now);
        edit(&mut doc);
        self.store.insert(doc);
    }

    /// Run stages, jumping the clock past every wait, until the record
    /// reaches `target`.
    pub async fn run_to(&self, target: DocumentStatus, document_id: &str) {
        let mut next = None;
        for _ in 0..200 {
            let doc = self.doc(document_id).await;
            if doc.status == target {
                return;
            }
            let stage = match next.take() {
                Some(stage) => stage,
                None => Stage::for_status(doc.status).unwrap_or_else(|| {
                    panic!("{document_id} stopped at {} before {target}", doc.status)
                }),
            };
            match self.pipeline.run_stage(stage, document_id).await.unwrap() {
                StepOutcome::Next(stage) => next = Some(stage),
                StepOutcome::RetryAt(stage, at) => {
                    self.clock.advance_to(at);
                    next = Some(stage);
                }
                StepOutcome::Done | StepOutcome::Retired => {}
            }
        }
        panic!("{document_id} never reached {target}");
    }
}
