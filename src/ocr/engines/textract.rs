//! OCR using AWS Textract.
//!
//! Single-page documents (and every page, when no bucket is configured) use
//! synchronous text detection on the page bytes. Pages of multi-page
//! documents are sent as asynchronous jobs that read the page from the
//! configured bucket.

use aws_sdk_textract::{
    error::{ProvideErrorMetadata, SdkError},
    primitives::Blob,
    types::{Block, BlockType, Document, DocumentLocation, JobStatus, S3Object},
};
use leaky_bucket::RateLimiter;

use crate::{
    aws::load_aws_config,
    intake::filename::sniff_supported_mime,
    prelude::*,
    rate_limit::RateLimit,
};

use super::{OcrEngine, OcrEngineOpts, OcrPageRequest, OcrPoll, OcrSubmission};

/// Textract error codes meaning the page itself is unreadable.
const REJECTED_DOCUMENT_CODES: &[&str] = &[
    "UnsupportedDocumentException",
    "BadDocumentException",
    "DocumentTooLargeException",
    "InvalidParameterException",
];

/// OCR engine wrapping the AWS Textract API.
pub struct TextractOcrEngine {
    /// AWS Textract client.
    client: aws_sdk_textract::Client,

    /// A rate limiter to avoid hitting API limits.
    rate_limiter: RateLimiter,

    /// Where async jobs read pages from.
    bucket: Option<String>,
}

impl TextractOcrEngine {
    /// Create a new `textract` engine.
    pub async fn new(opts: &OcrEngineOpts) -> Result<Self> {
        let config = load_aws_config().await?;
        let client = aws_sdk_textract::Client::new(&config);

        // Without a configured budget, allow one call per worker per second.
        let rate_limit = opts
            .rate_limit
            .clone()
            .unwrap_or_else(|| RateLimit::per_second(opts.concurrency_limit));
        Ok(Self {
            client,
            rate_limiter: rate_limit.limiter(),
            bucket: opts.textract_bucket.clone(),
        })
    }

    /// Turn a Textract error into either a page rejection or an
    /// infrastructure error.
    fn classify_error<E, R>(err: SdkError<E, R>) -> Result<OcrSubmission>
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug + Send + Sync + 'static,
    {
        match err.code() {
            Some(code) if REJECTED_DOCUMENT_CODES.contains(&code) => {
                let reason = err.message().unwrap_or(code).to_owned();
                Ok(OcrSubmission::Rejected {
                    kind: ErrKind::InvalidFileType,
                    reason: format!("{code}: {reason}"),
                })
            }
            _ => Err(anyhow::Error::new(err).context("AWS Textract error")),
        }
    }

    async fn detect_sync(&self, page: OcrPageRequest) -> Result<OcrSubmission> {
        if let Err(err) = sniff_supported_mime(&page.data) {
            return Ok(OcrSubmission::Rejected {
                kind: err.kind,
                reason: err.message,
            });
        }
        let document = Document::builder().bytes(Blob::new(page.data)).build();
        let response = self
            .client
            .detect_document_text()
            .document(document)
            .send()
            .await;
        match response {
            Ok(output) => {
                trace!("Document response: {output:#?}");
                Ok(OcrSubmission::Completed {
                    text: lines_text(output.blocks()),
                })
            }
            Err(err) => Self::classify_error(err),
        }
    }

    async fn start_async(&self, bucket: &str, page: &OcrPageRequest) -> Result<OcrSubmission> {
        let location = DocumentLocation::builder()
            .s3_object(S3Object::builder().bucket(bucket).name(&page.location).build())
            .build();
        let response = self
            .client
            .start_document_text_detection()
            .document_location(location)
            .send()
            .await;
        match response {
            Ok(output) => {
                let job_id = output
                    .job_id()
                    .ok_or_else(|| anyhow!("Textract did not return a job ID"))?;
                Ok(OcrSubmission::Started {
                    job_id: job_id.to_owned(),
                })
            }
            Err(err) => Self::classify_error(err),
        }
    }
}

#[async_trait]
impl OcrEngine for TextractOcrEngine {
    #[instrument(
        level = "debug",
        skip_all,
        fields(document_id = %page.document_id, page = %page.page_index)
    )]
    async fn submit(&self, page: OcrPageRequest) -> Result<OcrSubmission> {
        self.rate_limiter.acquire_one().await;
        match &self.bucket {
            Some(bucket) if page.page_count > 1 => self.start_async(bucket, &page).await,
            _ => self.detect_sync(page).await,
        }
    }

    #[instrument(level = "debug", skip_all, fields(job_id = %job_id))]
    async fn poll(&self, job_id: &str) -> Result<OcrPoll> {
        let mut blocks = vec![];
        let mut next_token = None;
        loop {
            self.rate_limiter.acquire_one().await;
            let output = self
                .client
                .get_document_text_detection()
                .job_id(job_id)
                .set_next_token(next_token.take())
                .send()
                .await
                .context("AWS Textract error")?;
            match output.job_status() {
                Some(JobStatus::InProgress) => return Ok(OcrPoll::Running),
                Some(JobStatus::Failed) => {
                    return Ok(OcrPoll::Failed {
                        kind: ErrKind::OcrJobFailed,
                        reason: output
                            .status_message()
                            .unwrap_or("Textract job failed")
                            .to_owned(),
                    });
                }
                Some(JobStatus::Succeeded | JobStatus::PartialSuccess) => {}
                other => return Err(anyhow!("unexpected Textract job status {other:?}")),
            }
            blocks.extend(output.blocks().iter().cloned());
            match output.next_token() {
                Some(token) => next_token = Some(token.to_owned()),
                None => break,
            }
        }
        let text = lines_text(&blocks);
        debug!(bytes = text.len(), "Textract job finished");
        Ok(OcrPoll::Succeeded { text })
    }
}

/// Join the text of every `LINE` block.
fn lines_text(blocks: &[Block]) -> String {
    blocks
        .iter()
        .filter(|block| block.block_type() == Some(&BlockType::Line))
        .filter_map(|block| block.text())
        .collect::<Vec<_>>()
        .join("\n")
}
