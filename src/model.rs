//! The per-document record and its state machine.

use std::{collections::BTreeMap, fmt};

use crate::{error::StoredError, prelude::*};

/// Where a document is in the pipeline. The record's status is the single
/// source of truth for which stage may act on it next.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    /// Created, but the batching decision has not been made yet.
    AwaitingPages,
    /// Waiting for more pages until `window_expires_at`.
    BatchingWindow,
    /// Per-page OCR jobs are being started and polled.
    OcrRunning,
    /// All pages have text; building the combined text.
    Aggregating,
    /// Looking for personal information in the extracted text.
    PiiProcessing,
    /// Running schema-driven classification.
    LlmRunning,
    /// Finished successfully.
    Complete,
    /// Finished with an error in `last_error`.
    Failed,
}

impl DocumentStatus {
    /// Position along the pipeline. Higher means later.
    pub const fn rank(self) -> u8 {
        match self {
            Self::AwaitingPages => 0,
            Self::BatchingWindow => 1,
            Self::OcrRunning => 2,
            Self::Aggregating => 3,
            Self::PiiProcessing => 4,
            Self::LlmRunning => 5,
            Self::Complete => 10,
            Self::Failed => 11,
        }
    }

    /// Terminal states never transition again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Has OCR finished for this document? Pages arriving after this point
    /// are recorded but not processed.
    pub const fn is_past_ocr(self) -> bool {
        self.rank() > Self::OcrRunning.rank()
    }

    /// Is `self -> next` an edge of the state machine?
    ///
    /// Self-edges on non-terminal states are allowed, so stages can record
    /// progress under the same status guard. `OcrRunning -> BatchingWindow`
    /// is the one backwards edge: a page arriving mid-OCR re-arms the window.
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        if self.is_terminal() {
            return false;
        }
        if self == next || next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (AwaitingPages, BatchingWindow)
                | (AwaitingPages, OcrRunning)
                | (BatchingWindow, OcrRunning)
                | (OcrRunning, BatchingWindow)
                | (OcrRunning, Aggregating)
                | (Aggregating, PiiProcessing)
                | (Aggregating, LlmRunning)
                | (PiiProcessing, LlmRunning)
                | (LlmRunning, Complete)
        )
    }

    /// The wire name of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingPages => "AWAITING_PAGES",
            Self::BatchingWindow => "BATCHING_WINDOW",
            Self::OcrRunning => "OCR_RUNNING",
            Self::Aggregating => "AGGREGATING",
            Self::PiiProcessing => "PII_PROCESSING",
            Self::LlmRunning => "LLM_RUNNING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One uploaded page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PageRef {
    /// The page number parsed from the filename. Determines text order.
    pub index: u32,
    /// Where the page's bytes live in object storage.
    pub location: String,
    /// The original filename.
    pub filename: String,
    /// When the page arrived.
    pub received_at: DateTime<Utc>,
}

/// How an OCR engine serviced a page.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OcrJobMode {
    /// Text returned in the same call.
    Sync,
    /// Job started, text obtained by polling.
    Async,
}

/// Per-page OCR job state.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OcrJobState {
    #[default]
    Pending,
    SyncComplete,
    AsyncStarted,
    AsyncComplete,
    Failed,
}

impl OcrJobState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::SyncComplete | Self::AsyncComplete | Self::Failed)
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::SyncComplete | Self::AsyncComplete)
    }
}

/// The OCR job for one page.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct OcrJob {
    /// The page this job belongs to.
    pub page_index: u32,
    /// How the engine serviced the page, once submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<OcrJobMode>,
    /// The engine's job identifier, for asynchronous jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Current state.
    pub state: OcrJobState,
    /// When the job was submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Why the job failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StoredError>,
}

/// Sub-status of the PII stage.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PiiStatus {
    PiiProcessing,
    PiiComplete,
    PiiFailed,
}

/// Result of the PII stage.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct RedactionResult {
    pub status: PiiStatus,
    /// Distinct PII types found, sorted.
    #[serde(default)]
    pub detected_types: Vec<String>,
    /// Total number of detections across all pages.
    #[serde(default)]
    pub total_detections: usize,
    /// Pages with at least one detection.
    #[serde(default)]
    pub pages_with_pii: Vec<u32>,
    /// The combined text with detections masked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted_text_ref: Option<String>,
    /// Full analysis document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StoredError>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Non-fatal problems worth surfacing to operators.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Some source files could not be moved to the completed area.
    PartialRelocation,
    /// The optional PII stage failed.
    PiiFailed,
    /// A page arrived after OCR had finished and was not processed.
    LatePage,
}

/// A non-fatal warning attached to a record.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct RecordWarning {
    pub kind: WarningKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Everything we know about one logical document.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct DocumentAggregate {
    /// Filename prefix shared by all pages.
    pub document_id: String,
    pub status: DocumentStatus,
    /// The storage location (bucket) the first page arrived in.
    pub source_location: String,
    /// Pages in arrival order. Never shrinks.
    pub pages: Vec<PageRef>,
    /// Always equal to `pages.len()`.
    pub pages_received: usize,
    /// When the current batching window was first opened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_opened_at: Option<DateTime<Utc>>,
    /// Present exactly when `status` is `BATCHING_WINDOW`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_expires_at: Option<DateTime<Utc>>,
    /// OCR jobs keyed by page location.
    #[serde(default)]
    pub ocr_jobs: BTreeMap<String, OcrJob>,
    /// OCR coordinator invocations in the current OCR episode.
    #[serde(default)]
    pub ocr_attempts: u32,
    /// Extracted text locations keyed by page location.
    #[serde(default)]
    pub ocr_text_refs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_text_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redaction: Option<RedactionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification_result_ref: Option<String>,
    /// The `document_type` chosen by the classification pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    #[serde(default)]
    pub moved_files: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<RecordWarning>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StoredError>,
    /// Incremented on every successful write.
    #[serde(default)]
    pub version: u64,
}

impl DocumentAggregate {
    /// A fresh record with no pages.
    pub fn new(document_id: &str, source_location: &str, now: DateTime<Utc>) -> Self {
        Self {
            document_id: document_id.to_owned(),
            status: DocumentStatus::AwaitingPages,
            source_location: source_location.to_owned(),
            pages: vec![],
            pages_received: 0,
            window_opened_at: None,
            window_expires_at: None,
            ocr_jobs: BTreeMap::new(),
            ocr_attempts: 0,
            ocr_text_refs: BTreeMap::new(),
            combined_text_ref: None,
            redaction: None,
            classification_result_ref: None,
            document_type: None,
            moved_files: vec![],
            warnings: vec![],
            created_at: now,
            updated_at: now,
            last_error: None,
            version: 0,
        }
    }

    /// Find a page by its parsed index.
    pub fn page(&self, index: u32) -> Option<&PageRef> {
        self.pages.iter().find(|p| p.index == index)
    }

    /// Pages sorted by parsed index, which is the order their text is
    /// combined in.
    pub fn pages_by_index(&self) -> Vec<&PageRef> {
        let mut pages = self.pages.iter().collect::<Vec<_>>();
        pages.sort_by_key(|p| p.index);
        pages
    }

    /// The OCR job state for a page, treating missing jobs as pending.
    pub fn ocr_state(&self, page: &PageRef) -> OcrJobState {
        self.ocr_jobs
            .get(&page.location)
            .map(|job| job.state)
            .unwrap_or_default()
    }

    /// Has every page's OCR job reached a terminal state?
    pub fn all_ocr_terminal(&self) -> bool {
        self.pages.iter().all(|p| self.ocr_state(p).is_terminal())
    }

    /// Has every page's OCR job succeeded?
    pub fn all_ocr_succeeded(&self) -> bool {
        self.pages.iter().all(|p| self.ocr_state(p).is_success())
    }

    /// Pages that went through OCR, by index. Pages that arrived after OCR
    /// finished have no job and are left out.
    pub fn ocr_pages(&self) -> Vec<&PageRef> {
        let mut pages = self.pages_by_index();
        pages.retain(|p| self.ocr_jobs.contains_key(&p.location));
        pages
    }

    /// Attach a warning.
    pub fn warn(&mut self, kind: WarningKind, message: String, at: DateTime<Utc>) {
        warn!(document_id = %self.document_id, ?kind, "{message}");
        self.warnings.push(RecordWarning { kind, message, at });
    }

    /// Check the structural invariants every stored record must satisfy.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.pages_received != self.pages.len() {
            return Err(format!(
                "pages_received is {} but there are {} pages",
                self.pages_received,
                self.pages.len()
            ));
        }
        let in_window = self.status == DocumentStatus::BatchingWindow;
        if in_window != self.window_expires_at.is_some() {
            return Err(format!(
                "window_expires_at must be set exactly in BATCHING_WINDOW (status {})",
                self.status
            ));
        }
        if self.combined_text_ref.is_some()
            && !self
                .ocr_jobs
                .values()
                .all(|job| job.state.is_terminal())
        {
            return Err("combined text exists while OCR jobs are still running".into());
        }
        Ok(())
    }
}
