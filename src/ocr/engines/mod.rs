//! OCR engine interface.
//!
//! An engine either returns text in the same call, or starts a job that the
//! coordinator polls on later invocations. Engines report two kinds of
//! failure:
//!
//! - Page-level rejections (`Rejected`, `Failed`). The page can never be
//!   OCRed, so the document fails.
//! - Infrastructure errors (`Err`). These leave the page pending and the
//!   coordinator tries again on its next invocation.

use std::sync::Arc;

use crate::{prelude::*, rate_limit::RateLimit};

pub mod tesseract;
pub mod textract;

/// A page to OCR.
#[derive(Clone, Debug)]
pub struct OcrPageRequest {
    pub document_id: String,
    pub page_index: u32,
    /// Object location of the page.
    pub location: String,
    /// How many pages the document has right now. Engines may use this to
    /// pick synchronous or asynchronous processing.
    pub page_count: usize,
    /// The page's bytes.
    pub data: Vec<u8>,
}

/// The result of submitting a page.
#[derive(Clone, Debug, PartialEq)]
pub enum OcrSubmission {
    /// The engine returned text immediately.
    Completed { text: String },
    /// The engine started a job to poll.
    Started { job_id: String },
    /// The engine will never be able to read this page.
    Rejected { kind: ErrKind, reason: String },
}

/// The result of polling a job.
#[derive(Clone, Debug, PartialEq)]
pub enum OcrPoll {
    Running,
    Succeeded { text: String },
    Failed { kind: ErrKind, reason: String },
}

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Submit one page.
    async fn submit(&self, page: OcrPageRequest) -> Result<OcrSubmission>;

    /// Check on a job started by [`OcrEngine::submit`].
    async fn poll(&self, job_id: &str) -> Result<OcrPoll>;
}

/// Options shared by all engines.
#[derive(Clone, Debug, Default)]
pub struct OcrEngineOpts {
    /// Bucket holding page objects, for engines that read pages from object
    /// storage themselves. Enables asynchronous jobs for multi-page
    /// documents.
    pub textract_bucket: Option<String>,
    /// Limit on engine API calls.
    pub rate_limit: Option<RateLimit>,
    /// Used to pick a default rate limit.
    pub concurrency_limit: usize,
}

/// Get the OCR engine with the given name.
pub async fn ocr_engine_for_name(name: &str, opts: &OcrEngineOpts) -> Result<Arc<dyn OcrEngine>> {
    match name {
        "textract" => Ok(Arc::new(textract::TextractOcrEngine::new(opts).await?)),
        "tesseract" => Ok(Arc::new(tesseract::TesseractOcrEngine::new())),
        _ => Err(anyhow!(
            "unknown OCR engine {name:?} (expected textract or tesseract)"
        )),
    }
}
