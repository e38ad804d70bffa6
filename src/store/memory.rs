//! In-memory document store for tests.

use std::{collections::BTreeMap, sync::Mutex};

use crate::{
    clock::Clock,
    model::{DocumentAggregate, DocumentStatus},
    prelude::*,
};

use super::{
    DocumentStore, Mutator, NewPage, UpsertOutcome, apply_transition, apply_upsert,
    not_found,
};

/// Records in a map. Each operation holds the lock for its whole
/// read-modify-write, which makes it atomic.
pub struct MemoryDocumentStore {
    clock: Arc<dyn Clock>,
    docs: Mutex<BTreeMap<String, DocumentAggregate>>,
}

impl MemoryDocumentStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            docs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Write a record as-is, bypassing every check.
    pub fn insert(&self, doc: DocumentAggregate) {
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        docs.insert(doc.document_id.clone(), doc);
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, document_id: &str) -> Result<Option<DocumentAggregate>, PipelineError> {
        let docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(docs.get(document_id).cloned())
    }

    async fn upsert_page(&self, page: NewPage) -> Result<UpsertOutcome, PipelineError> {
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        let existing = docs.get(&page.document_id).cloned();
        let outcome = apply_upsert(existing, page, self.clock.now());
        if outcome.appended {
            docs.insert(
                outcome.aggregate.document_id.clone(),
                outcome.aggregate.clone(),
            );
        }
        Ok(outcome)
    }

    async fn conditional_transition(
        &self,
        document_id: &str,
        expected: DocumentStatus,
        next: DocumentStatus,
        mutator: Mutator<'_>,
    ) -> Result<DocumentAggregate, PipelineError> {
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        let current = docs.get(document_id).ok_or_else(|| not_found(document_id))?;
        let updated = apply_transition(current, expected, next, mutator, self.clock.now())?;
        docs.insert(document_id.to_owned(), updated.clone());
        Ok(updated)
    }

    async fn list(&self) -> Result<Vec<DocumentAggregate>, PipelineError> {
        let docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(docs.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;

    use super::*;
    use crate::clock::ManualClock;

    fn store() -> Arc<MemoryDocumentStore> {
        Arc::new(MemoryDocumentStore::new(Arc::new(ManualClock::new(Utc::now()))))
    }

    fn page(index: u32) -> NewPage {
        NewPage {
            document_id: "inv-1".to_owned(),
            page_index: index,
            location: format!("incoming/inv-1_{index}.jpg"),
            filename: format!("inv-1_{index}.jpg"),
            source_location: "uploads".to_owned(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_lose_nothing() {
        let store = store();
        let tasks = (1..=50).chain(1..=50).map(|index| {
            let store = store.clone();
            tokio::spawn(async move { store.upsert_page(page(index)).await.unwrap() })
        });
        let outcomes = join_all(tasks).await;
        let created = outcomes
            .iter()
            .filter(|o| o.as_ref().unwrap().created)
            .count();
        assert_eq!(created, 1);

        let doc = store.get("inv-1").await.unwrap().unwrap();
        assert_eq!(doc.pages_received, 50);
        assert_eq!(doc.pages.len(), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_only_one_transition_wins() {
        let store = store();
        store.upsert_page(page(1)).await.unwrap();
        let tasks = (0..16).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .conditional_transition(
                        "inv-1",
                        DocumentStatus::AwaitingPages,
                        DocumentStatus::OcrRunning,
                        crate::store::no_changes(),
                    )
                    .await
            })
        });
        let results = join_all(tasks).await;
        let wins = results.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
        assert_eq!(wins, 1);
        for result in results {
            if let Err(err) = result.unwrap() {
                assert!(err.is_stale());
            }
        }
    }

    #[tokio::test]
    async fn test_transition_on_missing_document() {
        let store = store();
        let err = store
            .conditional_transition(
                "nope",
                DocumentStatus::AwaitingPages,
                DocumentStatus::OcrRunning,
                crate::store::no_changes(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrKind::StorageAccessError);
    }
}
