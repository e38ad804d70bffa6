//! Optional detection and masking of personal information.
//!
//! Detection is pattern based. Each page's OCR text is scanned on its own, so
//! detections carry a page index and a byte span into that page's text. The
//! redacted combined text is built from the redacted pages in the same way
//! the aggregator builds the plain one.

use std::{collections::BTreeSet, fmt, sync::LazyLock};

use futures::{StreamExt as _, TryStreamExt as _, stream};
use regex::Regex;

use crate::{
    aggregate::combine_pages,
    error::StoredError,
    model::{DocumentStatus, PiiStatus, RedactionResult, WarningKind},
    objects::layout,
    pipeline::{Pipeline, Stage, StepOutcome},
    prelude::*,
};

/// How many pages to scan at once.
const PAGE_CONCURRENCY: usize = 8;

/// Kinds of personal information we look for.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PiiType {
    Ssn,
    AccountNumber,
    Email,
    Phone,
    Address,
    ZipCode,
    PersonalName,
}

impl PiiType {
    pub fn as_str(self) -> &'static str {
        match self {
            PiiType::Ssn => "ssn",
            PiiType::AccountNumber => "account_number",
            PiiType::Email => "email",
            PiiType::Phone => "phone",
            PiiType::Address => "address",
            PiiType::ZipCode => "zip_code",
            PiiType::PersonalName => "personal_name",
        }
    }
}

impl fmt::Display for PiiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How sure a pattern is.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// One piece of personal information found in a page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PiiDetection {
    #[serde(rename = "type")]
    pub pii_type: PiiType,
    pub text: String,
    pub page_index: u32,
    /// Byte offsets into the page text.
    pub start: usize,
    pub end: usize,
    pub confidence: Confidence,
}

/// Fixed-format patterns.
static PATTERNS: LazyLock<Vec<(PiiType, Regex, Confidence)>> = LazyLock::new(|| {
    [
        (PiiType::Ssn, r"\b\d{3}-\d{2}-\d{4}\b", Confidence::High),
        (
            PiiType::AccountNumber,
            r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b",
            Confidence::High,
        ),
        (
            PiiType::Email,
            r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b",
            Confidence::High,
        ),
        (PiiType::Phone, r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b", Confidence::Medium),
        (
            PiiType::Address,
            r"(?i)\b\d+\s+[a-z ]+\b(?:street|st|avenue|ave|road|rd|drive|dr|lane|ln|boulevard|blvd|way|circle|cir|court|ct)\b",
            Confidence::Medium,
        ),
        (PiiType::ZipCode, r"\b\d{5}(?:-\d{4})?\b", Confidence::Low),
    ]
    .into_iter()
    .map(|(pii_type, pattern, confidence)| {
        (
            pii_type,
            Regex::new(pattern).expect("built-in PII pattern should be valid"),
            confidence,
        )
    })
    .collect()
});

/// Capitalized two-word names following a salutation or form label.
static NAME_CONTEXTS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i:\b(?:dear|to|from)\s+|\b(?:mr|mrs|ms|dr)\.\s*)([A-Z][a-z]+\s+[A-Z][a-z]+)",
        r"(?i:\b(?:name|applicant|customer|client):\s*)([A-Z][a-z]+\s+[A-Z][a-z]+)",
        r"(?i:\b(?:signed|by):\s*)([A-Z][a-z]+\s+[A-Z][a-z]+)",
    ]
    .into_iter()
    .map(|pattern| Regex::new(pattern).expect("built-in name pattern should be valid"))
    .collect()
});

/// Words that mark a name as a business rather than a person.
const BUSINESS_INDICATORS: &[&str] = &[
    "llc", "inc", "corp", "company", "associates", "group", "partners", "chevrolet",
    "ford", "toyota", "honda", "bmw", "mercedes", "audi", "bank", "credit", "union",
    "insurance", "agency", "services",
];

/// Nearby words that suggest a business context.
static BUSINESS_CONTEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:from|at|company|business|dealer|dealership)\b")
        .expect("built-in business context pattern should be valid")
});

/// Find personal information in one page of text.
pub fn detect_pii(page_index: u32, text: &str) -> Vec<PiiDetection> {
    let mut detections = vec![];
    for (pii_type, pattern, confidence) in PATTERNS.iter() {
        for m in pattern.find_iter(text) {
            detections.push(PiiDetection {
                pii_type: *pii_type,
                text: m.as_str().to_owned(),
                page_index,
                start: m.start(),
                end: m.end(),
                confidence: *confidence,
            });
        }
    }
    for pattern in NAME_CONTEXTS.iter() {
        for caps in pattern.captures_iter(text) {
            let Some(name) = caps.get(1) else { continue };
            if is_likely_personal_name(text, name.start(), name.end()) {
                detections.push(PiiDetection {
                    pii_type: PiiType::PersonalName,
                    text: name.as_str().to_owned(),
                    page_index,
                    start: name.start(),
                    end: name.end(),
                    confidence: Confidence::Medium,
                });
            }
        }
    }
    detections.sort_by_key(|d| (d.start, std::cmp::Reverse(d.end)));
    detections
}

/// Does the name at `text[start..end]` look like a person and not a
/// business? Looks at the name itself and at 50 bytes either side of it.
fn is_likely_personal_name(text: &str, start: usize, end: usize) -> bool {
    let name = text[start..end].to_lowercase();
    if name
        .split_whitespace()
        .any(|word| BUSINESS_INDICATORS.contains(&word))
    {
        return false;
    }
    let before = &text[char_boundary_before(text, start.saturating_sub(50))..start];
    let after = &text[end..char_boundary_after(text, end + 50)];
    !(BUSINESS_CONTEXT.is_match(before) || BUSINESS_CONTEXT.is_match(after))
}

fn char_boundary_before(text: &str, mut index: usize) -> usize {
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn char_boundary_after(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

/// Replace each detection with `[REDACTED:<type>]`. Overlapping detections
/// are merged into one masked span, labeled with the type of the one that
/// starts first (and then the longest).
pub fn redact(text: &str, detections: &[PiiDetection]) -> String {
    let mut spans = detections.iter().collect::<Vec<_>>();
    spans.sort_by_key(|d| (d.start, std::cmp::Reverse(d.end)));

    let mut merged: Vec<(usize, usize, PiiType)> = vec![];
    for detection in spans {
        match merged.last_mut() {
            Some((_, end, _)) if detection.start < *end => {
                *end = (*end).max(detection.end);
            }
            _ => merged.push((detection.start, detection.end, detection.pii_type)),
        }
    }

    let mut redacted = String::with_capacity(text.len());
    let mut pos = 0;
    for (start, end, pii_type) in merged {
        redacted.push_str(&text[pos..start]);
        redacted.push_str(&format!("[REDACTED:{pii_type}]"));
        pos = end;
    }
    redacted.push_str(&text[pos..]);
    redacted
}

/// What the PII stage produced.
#[derive(Debug)]
struct PiiAnalysis {
    detections: Vec<PiiDetection>,
    redacted_pages: Vec<(u32, String)>,
    total_pages: usize,
}

/// The scheduler's entry point for [`Stage::Pii`].
#[instrument(level = "debug", skip_all, fields(document_id = %document_id))]
pub async fn run_pii_stage(
    pipeline: &Pipeline,
    document_id: &str,
) -> Result<StepOutcome, PipelineError> {
    let doc = pipeline.load(document_id).await?;
    if doc.status != DocumentStatus::PiiProcessing {
        return Err(PipelineError::stale(format!(
            "expected PII_PROCESSING, found {}",
            doc.status
        )));
    }
    let started_at = match &doc.redaction {
        Some(redaction) => redaction.started_at,
        None => {
            let started_at = pipeline.clock.now();
            pipeline
                .store
                .conditional_transition(
                    document_id,
                    DocumentStatus::PiiProcessing,
                    DocumentStatus::PiiProcessing,
                    Box::new(move |doc| {
                        doc.redaction = Some(RedactionResult {
                            status: PiiStatus::PiiProcessing,
                            detected_types: vec![],
                            total_detections: 0,
                            pages_with_pii: vec![],
                            redacted_text_ref: None,
                            analysis_ref: None,
                            error: None,
                            started_at,
                            finished_at: None,
                        });
                        Ok(())
                    }),
                )
                .await?;
            started_at
        }
    };

    let pages = doc
        .ocr_pages()
        .into_iter()
        .map(|page| {
            let text_ref = doc.ocr_text_refs.get(&page.location).cloned();
            (page.index, text_ref)
        })
        .collect::<Vec<_>>();

    let result = match analyze(pipeline, document_id, pages).await {
        Ok(analysis) => write_results(pipeline, document_id, analysis, started_at).await,
        Err(err) => Err(err),
    };
    let now = pipeline.clock.now();
    let redaction = match result {
        Ok(redaction) => {
            info!(
                %document_id,
                detections = redaction.total_detections,
                types = ?redaction.detected_types,
                "PII detection complete"
            );
            redaction
        }
        Err(err) if err.is_stale() => return Err(err),
        Err(err) => {
            let stored = StoredError::new(&err, Stage::Pii.name(), now);
            let redaction = RedactionResult {
                status: PiiStatus::PiiFailed,
                detected_types: vec![],
                total_detections: 0,
                pages_with_pii: vec![],
                redacted_text_ref: None,
                analysis_ref: None,
                error: Some(stored.clone()),
                started_at,
                finished_at: Some(now),
            };
            if pipeline.config.pii.mandatory {
                return fail_mandatory(pipeline, document_id, &err, stored, redaction).await;
            }
            redaction
        }
    };

    pipeline
        .store
        .conditional_transition(
            document_id,
            DocumentStatus::PiiProcessing,
            DocumentStatus::LlmRunning,
            Box::new(move |doc| {
                if let Some(err) = &redaction.error {
                    doc.warn(
                        WarningKind::PiiFailed,
                        format!("PII detection failed: {}", err.message),
                        now,
                    );
                }
                doc.redaction = Some(redaction);
                Ok(())
            }),
        )
        .await?;
    Ok(StepOutcome::Next(Stage::Classify))
}

/// Fail the document, keeping the failed PII sub-status alongside the error.
async fn fail_mandatory(
    pipeline: &Pipeline,
    document_id: &str,
    err: &PipelineError,
    stored: StoredError,
    redaction: RedactionResult,
) -> Result<StepOutcome, PipelineError> {
    error!(
        %document_id,
        kind = %err.kind,
        category = %stored.category,
        "PII stage is mandatory, document failed: {}",
        err.message,
    );
    pipeline
        .store
        .conditional_transition(
            document_id,
            DocumentStatus::PiiProcessing,
            DocumentStatus::Failed,
            Box::new(move |doc| {
                doc.redaction = Some(redaction);
                doc.last_error = Some(stored);
                Ok(())
            }),
        )
        .await?;
    Ok(StepOutcome::Done)
}

/// Scan every page, a few at a time.
async fn analyze(
    pipeline: &Pipeline,
    document_id: &str,
    pages: Vec<(u32, Option<String>)>,
) -> Result<PiiAnalysis, PipelineError> {
    let total_pages = pages.len();
    let scanned = stream::iter(pages)
        .map(|(page_index, text_ref)| async move {
            let text_ref = text_ref.ok_or_else(|| {
                PipelineError::new(
                    ErrKind::Unknown,
                    format!("page {page_index} of {document_id} has no OCR text"),
                )
            })?;
            let text = pipeline.objects.get_text(&text_ref).await?;
            let detections = detect_pii(page_index, &text);
            debug!(page = page_index, detections = detections.len(), "Scanned page");
            let redacted = redact(&text, &detections);
            Ok::<_, PipelineError>((page_index, detections, redacted))
        })
        .buffered(PAGE_CONCURRENCY)
        .try_collect::<Vec<_>>()
        .await?;

    let mut analysis = PiiAnalysis {
        detections: vec![],
        redacted_pages: vec![],
        total_pages,
    };
    for (page_index, detections, redacted) in scanned {
        analysis.detections.extend(detections);
        analysis.redacted_pages.push((page_index, redacted));
    }
    Ok(analysis)
}

/// Write the redacted text and the analysis document.
async fn write_results(
    pipeline: &Pipeline,
    document_id: &str,
    analysis: PiiAnalysis,
    started_at: DateTime<Utc>,
) -> Result<RedactionResult, PipelineError> {
    let detected_types = analysis
        .detections
        .iter()
        .map(|d| d.pii_type.as_str().to_owned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();
    let pages_with_pii = analysis
        .detections
        .iter()
        .map(|d| d.page_index)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>();

    let redacted_ref = layout::redacted_text(document_id);
    pipeline
        .objects
        .put_text(&redacted_ref, &combine_pages(&analysis.redacted_pages))
        .await?;

    let analysis_ref = layout::pii_analysis(document_id);
    let document = json!({
        "document_id": document_id,
        "detected_pii": !analysis.detections.is_empty(),
        "pii_detections": analysis.detections,
        "processing_summary": {
            "total_pages": analysis.total_pages,
            "pages_with_pii": pages_with_pii.len(),
            "total_pii_instances": analysis.detections.len(),
            "pii_types_detected": detected_types,
        },
    });
    pipeline.objects.put_json(&analysis_ref, &document).await?;

    Ok(RedactionResult {
        status: PiiStatus::PiiComplete,
        detected_types,
        total_detections: analysis.detections.len(),
        pages_with_pii,
        redacted_text_ref: Some(redacted_ref),
        analysis_ref: Some(analysis_ref),
        error: None,
        started_at,
        finished_at: Some(pipeline.clock.now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{PiiConfig, PipelineConfig},
        test_support::TestHarness,
    };

    fn types(detections: &[PiiDetection]) -> Vec<PiiType> {
        detections.iter().map(|d| d.pii_type).collect()
    }

    #[test]
    fn test_fixed_patterns() {
        let text = "SSN 123-45-6789, card 4111 1111 1111 1111, mail jo@example.com";
        let detections = detect_pii(1, text);
        assert_eq!(
            types(&detections),
            vec![PiiType::Ssn, PiiType::AccountNumber, PiiType::Email]
        );
        assert_eq!(&text[detections[0].start..detections[0].end], "123-45-6789");
        assert_eq!(detections[0].confidence, Confidence::High);
    }

    #[test]
    fn test_address_and_zip() {
        let detections = detect_pii(2, "Ship to 42 Elm Street, Springfield 62704");
        assert!(types(&detections).contains(&PiiType::Address));
        assert!(types(&detections).contains(&PiiType::ZipCode));
        assert!(detections.iter().all(|d| d.page_index == 2));
    }

    #[test]
    fn test_names_need_context() {
        let detections = detect_pii(1, "Dear Jane Doe,\nthanks for your order.");
        assert_eq!(types(&detections), vec![PiiType::PersonalName]);
        assert_eq!(detections[0].text, "Jane Doe");

        // Business names and business contexts are skipped.
        assert!(detect_pii(1, "Customer: Acme Insurance").is_empty());
        assert!(detect_pii(1, "Dear Jane Doe, greetings from the dealership").is_empty());
        // No context, no detection.
        assert!(detect_pii(1, "Jane Doe").is_empty());
    }

    #[test]
    fn test_redact_merges_overlaps() {
        let text = "Call 555-123-4567 now";
        let detections = detect_pii(1, text);
        assert_eq!(redact(text, &detections), "Call [REDACTED:phone] now");

        let text = "Card 4111-1111-1111-1111.";
        let detections = detect_pii(1, text);
        assert_eq!(redact(text, &detections), "Card [REDACTED:account_number].");
    }

    #[test]
    fn test_redact_masks_union_of_partial_overlaps() {
        let text = "id 123456789 ok";
        let detection = |pii_type, start, end| PiiDetection {
            page_index: 1,
            pii_type,
            start,
            end,
            text: text[start..end].to_owned(),
            confidence: Confidence::High,
        };
        let detections = [
            detection(PiiType::Ssn, 3, 9),
            detection(PiiType::AccountNumber, 6, 12),
        ];
        assert_eq!(redact(text, &detections), "id [REDACTED:ssn] ok");

        // Touching spans stay separate.
        let detections = [
            detection(PiiType::Ssn, 3, 6),
            detection(PiiType::AccountNumber, 6, 12),
        ];
        assert_eq!(
            redact(text, &detections),
            "id [REDACTED:ssn][REDACTED:account_number] ok"
        );
    }

    fn pii_config(mandatory: bool) -> PipelineConfig {
        PipelineConfig {
            pii: PiiConfig {
                enabled: true,
                mandatory,
                ..PiiConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_stage_writes_redacted_text() {
        let h = TestHarness::with_config(pii_config(false));
        h.add_page("inv-1", 1).await;
        h.run_to(DocumentStatus::PiiProcessing, "inv-1").await;
        let doc = h.doc("inv-1").await;
        h.pipeline
            .objects
            .put_text(&doc.ocr_text_refs[&doc.pages[0].location], "Reach me at jo@example.com")
            .await
            .unwrap();

        let outcome = run_pii_stage(&h.pipeline, "inv-1").await.unwrap();
        assert_eq!(outcome, StepOutcome::Next(Stage::Classify));

        let doc = h.doc("inv-1").await;
        assert_eq!(doc.status, DocumentStatus::LlmRunning);
        let redaction = doc.redaction.unwrap();
        assert_eq!(redaction.status, PiiStatus::PiiComplete);
        assert_eq!(redaction.detected_types, vec!["email"]);
        assert_eq!(redaction.pages_with_pii, vec![1]);
        let redacted = h
            .pipeline
            .objects
            .get_text(&redaction.redacted_text_ref.unwrap())
            .await
            .unwrap();
        assert_eq!(redacted, "--- Page 1 ---\nReach me at [REDACTED:email]\n\n");
        let analysis = h
            .pipeline
            .objects
            .get_text(&redaction.analysis_ref.unwrap())
            .await
            .unwrap();
        assert!(analysis.contains("\"total_pii_instances\": 1"));
    }

    #[tokio::test]
    async fn test_optional_failure_continues_with_warning() {
        let h = TestHarness::with_config(pii_config(false));
        h.add_page("inv-1", 1).await;
        h.run_to(DocumentStatus::PiiProcessing, "inv-1").await;
        h.objects().deny(&layout::redacted_text("inv-1"));

        let outcome = run_pii_stage(&h.pipeline, "inv-1").await.unwrap();
        assert_eq!(outcome, StepOutcome::Next(Stage::Classify));
        let doc = h.doc("inv-1").await;
        assert_eq!(doc.status, DocumentStatus::LlmRunning);
        let redaction = doc.redaction.unwrap();
        assert_eq!(redaction.status, PiiStatus::PiiFailed);
        assert_eq!(redaction.error.unwrap().kind, ErrKind::StorageAccessError);
        assert_eq!(doc.warnings[0].kind, WarningKind::PiiFailed);
    }

    #[tokio::test]
    async fn test_mandatory_failure_fails_document() {
        let h = TestHarness::with_config(pii_config(true));
        h.add_page("inv-1", 1).await;
        h.run_to(DocumentStatus::PiiProcessing, "inv-1").await;
        h.objects().deny(&layout::redacted_text("inv-1"));

        let outcome = h.pipeline.run_stage(Stage::Pii, "inv-1").await.unwrap();
        assert_eq!(outcome, StepOutcome::Done);
        let doc = h.doc("inv-1").await;
        assert_eq!(doc.status, DocumentStatus::Failed);
        let redaction = doc.redaction.unwrap();
        assert_eq!(redaction.status, PiiStatus::PiiFailed);
        assert!(redaction.finished_at.is_some());
        assert_eq!(redaction.error.unwrap().stage, "pii");
        assert_eq!(doc.last_error.unwrap().stage, "pii");
    }
}
