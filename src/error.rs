//! Error taxonomy shared by every pipeline stage.
//!
//! Stages return [`PipelineError`], which carries an [`ErrKind`]. Adapter code
//! (AWS, OpenAI, the filesystem) works with [`anyhow::Error`] internally and
//! converts at the boundary using [`ResultExt::or_kind`]. When an error is
//! written to a document record it becomes a [`StoredError`], which adds a
//! human-readable [`ErrorCategory`].

use std::{fmt, sync::LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The kinds of error a pipeline stage can report.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
pub enum ErrKind {
    /// The uploaded filename does not contain a page number. Never attached to
    /// a document record.
    InvalidFilename,
    /// A page is not a supported image or PDF.
    InvalidFileType,
    /// An object or record could not be read or written.
    StorageAccessError,
    /// The OCR engine rejected or failed a page.
    OcrJobFailed,
    /// The classification API failed after retries.
    ClassificationApiFailed,
    /// A retry budget was exhausted.
    Timeout,
    /// A conditional transition lost a race. Handled locally by the caller.
    StaleTransition,
    /// Anything else.
    Unknown,
}

impl ErrKind {
    /// The name of this kind, as it appears in records and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrKind::InvalidFilename => "InvalidFilename",
            ErrKind::InvalidFileType => "InvalidFileType",
            ErrKind::StorageAccessError => "StorageAccessError",
            ErrKind::OcrJobFailed => "OcrJobFailed",
            ErrKind::ClassificationApiFailed => "ClassificationApiFailed",
            ErrKind::Timeout => "Timeout",
            ErrKind::StaleTransition => "StaleTransition",
            ErrKind::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ErrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised by a pipeline stage.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{kind}: {message}")]
pub struct PipelineError {
    /// What went wrong, in machine-readable form.
    pub kind: ErrKind,
    /// Details, including any context from the underlying error chain.
    pub message: String,
}

impl PipelineError {
    /// Create a new error.
    pub fn new(kind: ErrKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A conditional transition found a different status than expected.
    pub fn stale(message: impl Into<String>) -> Self {
        Self::new(ErrKind::StaleTransition, message)
    }

    /// Wrap an [`anyhow::Error`], keeping its full context chain.
    pub fn from_anyhow(kind: ErrKind, err: &anyhow::Error) -> Self {
        Self::new(kind, format!("{err:#}"))
    }

    /// Did we lose a race with another invocation?
    pub fn is_stale(&self) -> bool {
        self.kind == ErrKind::StaleTransition
    }
}

/// Convert adapter errors into [`PipelineError`] values.
pub trait ResultExt<T> {
    /// Convert any error into a [`PipelineError`] of the given kind.
    fn or_kind(self, kind: ErrKind) -> Result<T, PipelineError>;
}

impl<T> ResultExt<T> for anyhow::Result<T> {
    fn or_kind(self, kind: ErrKind) -> Result<T, PipelineError> {
        self.map_err(|err| PipelineError::from_anyhow(kind, &err))
    }
}

/// A human-readable cause, derived from an error's kind and message.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    UnsupportedFormat,
    PermissionDenied,
    MissingObject,
    Throttled,
    TimedOut,
    BadFilename,
    OcrFailure,
    ClassificationFailure,
    Unknown,
}

/// Substring patterns checked, in order, against error messages.
static CATEGORY_PATTERNS: LazyLock<Vec<(Regex, ErrorCategory)>> = LazyLock::new(|| {
    [
        (
            r"(?i)unsupported ?document|unsupported (file|format|type)|bad ?document|not a supported",
            ErrorCategory::UnsupportedFormat,
        ),
        (
            r"(?i)access ?denied|forbidden|permission denied",
            ErrorCategory::PermissionDenied,
        ),
        (
            r"(?i)no ?such ?(file|key)|not ?found",
            ErrorCategory::MissingObject,
        ),
        (
            r"(?i)throttl|rate ?limit|too many requests|provisioned ?throughput",
            ErrorCategory::Throttled,
        ),
        (
            r"(?i)timed? ?out|deadline exceeded|retry budget",
            ErrorCategory::TimedOut,
        ),
    ]
    .into_iter()
    .map(|(pattern, category)| {
        (
            Regex::new(pattern).expect("built-in category pattern should be valid"),
            category,
        )
    })
    .collect()
});

impl ErrorCategory {
    /// Classify an error. Message patterns win over the error kind, because
    /// they usually name the root cause more precisely.
    pub fn classify(kind: ErrKind, message: &str) -> Self {
        for (pattern, category) in CATEGORY_PATTERNS.iter() {
            if pattern.is_match(message) {
                return *category;
            }
        }
        match kind {
            ErrKind::InvalidFilename => ErrorCategory::BadFilename,
            ErrKind::InvalidFileType => ErrorCategory::UnsupportedFormat,
            ErrKind::StorageAccessError => ErrorCategory::MissingObject,
            ErrKind::OcrJobFailed => ErrorCategory::OcrFailure,
            ErrKind::ClassificationApiFailed => ErrorCategory::ClassificationFailure,
            ErrKind::Timeout => ErrorCategory::TimedOut,
            ErrKind::StaleTransition | ErrKind::Unknown => ErrorCategory::Unknown,
        }
    }

    /// A short description suitable for operators.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCategory::UnsupportedFormat => "Unsupported or corrupt file format",
            ErrorCategory::PermissionDenied => "Storage permission denied",
            ErrorCategory::MissingObject => "Source object could not be found",
            ErrorCategory::Throttled => "Rate limited by an upstream service",
            ErrorCategory::TimedOut => "Processing timed out",
            ErrorCategory::BadFilename => {
                "Filename does not follow the <document>_<page>.<ext> pattern"
            }
            ErrorCategory::OcrFailure => "Text extraction failed",
            ErrorCategory::ClassificationFailure => "Classification service failed",
            ErrorCategory::Unknown => "Unknown error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// An error as recorded on a document.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct StoredError {
    /// Machine-readable kind.
    pub kind: ErrKind,
    /// Full error message.
    pub message: String,
    /// Human-readable cause.
    pub category: ErrorCategory,
    /// The stage that reported the error.
    pub stage: String,
    /// When the error was recorded.
    pub occurred_at: DateTime<Utc>,
}

impl StoredError {
    /// Record `err` as reported by `stage` at `now`.
    pub fn new(err: &PipelineError, stage: &str, now: DateTime<Utc>) -> Self {
        Self {
            kind: err.kind,
            message: err.message.clone(),
            category: ErrorCategory::classify(err.kind, &err.message),
            stage: stage.to_owned(),
            occurred_at: now,
        }
    }
}
