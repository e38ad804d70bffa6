//! The document record store.
//!
//! The store is the only shared mutable state in the pipeline. All
//! coordination between stages goes through two primitives:
//!
//! - [`DocumentStore::upsert_page`], which atomically creates a record or
//!   appends a page to it, and is a no-op for a page it already has.
//! - [`DocumentStore::conditional_transition`], a compare-and-swap on the
//!   record's status. If the stored status is not the expected one, nothing is
//!   written and the call fails with [`ErrKind::StaleTransition`].
//!
//! Both implementations share [`apply_upsert`] and [`apply_transition`], so
//! the semantics only live in one place.

use crate::{
    model::{DocumentAggregate, DocumentStatus, PageRef},
    prelude::*,
};

pub mod fs;
#[cfg(test)]
pub mod memory;

/// A page to add to a document.
#[derive(Clone, Debug, PartialEq)]
pub struct NewPage {
    pub document_id: String,
    pub page_index: u32,
    /// Object location of the page.
    pub location: String,
    pub filename: String,
    /// The storage location (bucket) the page arrived in.
    pub source_location: String,
}

/// What [`DocumentStore::upsert_page`] did.
#[derive(Clone, Debug)]
pub struct UpsertOutcome {
    /// The record after the upsert.
    pub aggregate: DocumentAggregate,
    /// Did this call create the record?
    pub created: bool,
    /// Did this call add a page? False for duplicates.
    pub appended: bool,
    /// The page this call was about.
    pub page_index: u32,
}

/// Edits a record inside a conditional transition. Returning an error aborts
/// the transition without writing anything.
pub type Mutator<'a> =
    Box<dyn FnOnce(&mut DocumentAggregate) -> Result<(), PipelineError> + Send + 'a>;

/// A mutator that changes nothing besides the status.
pub fn no_changes<'a>() -> Mutator<'a> {
    Box::new(|_| Ok(()))
}

/// Durable storage for [`DocumentAggregate`] records.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Fetch a record.
    async fn get(&self, document_id: &str) -> Result<Option<DocumentAggregate>, PipelineError>;

    /// Create the record if needed, and add the page unless a page with the
    /// same index is already present.
    async fn upsert_page(&self, page: NewPage) -> Result<UpsertOutcome, PipelineError>;

    /// Apply `mutator` and set the status to `next`, but only if the stored
    /// status is still `expected`.
    async fn conditional_transition(
        &self,
        document_id: &str,
        expected: DocumentStatus,
        next: DocumentStatus,
        mutator: Mutator<'_>,
    ) -> Result<DocumentAggregate, PipelineError>;

    /// Every record.
    async fn list(&self) -> Result<Vec<DocumentAggregate>, PipelineError>;

    /// Every record with the given status.
    async fn list_by_status(
        &self,
        status: DocumentStatus,
    ) -> Result<Vec<DocumentAggregate>, PipelineError> {
        let mut docs = self.list().await?;
        docs.retain(|doc| doc.status == status);
        Ok(docs)
    }
}

/// Upsert logic shared by all stores.
pub fn apply_upsert(
    existing: Option<DocumentAggregate>,
    page: NewPage,
    now: DateTime<Utc>,
) -> UpsertOutcome {
    let created = existing.is_none();
    let mut doc = existing.unwrap_or_else(|| {
        DocumentAggregate::new(&page.document_id, &page.source_location, now)
    });
    if doc.page(page.page_index).is_some() {
        debug!(
            document_id = %page.document_id,
            page = page.page_index,
            "Page already recorded",
        );
        return UpsertOutcome {
            aggregate: doc,
            created,
            appended: false,
            page_index: page.page_index,
        };
    }
    let page_index = page.page_index;
    doc.pages.push(PageRef {
        index: page_index,
        location: page.location,
        filename: page.filename,
        received_at: now,
    });
    doc.pages_received = doc.pages.len();
    doc.updated_at = now;
    doc.version += 1;
    UpsertOutcome {
        aggregate: doc,
        created,
        appended: true,
        page_index,
    }
}

/// Conditional transition logic shared by all stores. Returns the record to
/// write, leaving `current` untouched.
pub fn apply_transition(
    current: &DocumentAggregate,
    expected: DocumentStatus,
    next: DocumentStatus,
    mutator: Mutator<'_>,
    now: DateTime<Utc>,
) -> Result<DocumentAggregate, PipelineError> {
    if current.status != expected {
        return Err(PipelineError::stale(format!(
            "{}: expected {expected}, found {}",
            current.document_id, current.status
        )));
    }
    if !expected.can_transition_to(next) {
        return Err(PipelineError::new(
            ErrKind::Unknown,
            format!(
                "{}: illegal transition {expected} -> {next}",
                current.document_id
            ),
        ));
    }
    let mut updated = current.clone();
    mutator(&mut updated)?;
    updated.status = next;
    if next != DocumentStatus::BatchingWindow {
        updated.window_expires_at = None;
    }
    updated.updated_at = now;
    updated.version = current.version + 1;
    updated
        .check_invariants()
        .map_err(|msg| PipelineError::new(ErrKind::Unknown, msg))?;
    Ok(updated)
}

/// A missing record, reported as a storage error.
pub fn not_found(document_id: &str) -> PipelineError {
    PipelineError::new(
        ErrKind::StorageAccessError,
        format!("document {document_id} not found"),
    )
}
