//! A document store that keeps one JSON file per record.
//!
//! Writes are serialized by an in-process lock and made atomic with a
//! write-then-rename, so a crash never leaves a half-written record. This
//! store assumes one writing process per directory.

use tokio::{fs, sync::Mutex};

use crate::{
    clock::Clock,
    model::{DocumentAggregate, DocumentStatus},
    prelude::*,
};

use super::{
    DocumentStore, Mutator, NewPage, UpsertOutcome, apply_transition, apply_upsert,
    not_found,
};

/// Records stored as `<dir>/<document_id>.json`.
pub struct FsDocumentStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl FsDocumentStore {
    /// Open (and create if needed) a store in `dir`.
    pub async fn open(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("cannot create state directory {}", dir.display()))?;
        Ok(Self {
            dir,
            clock,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, document_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", urlencoding::encode(document_id)))
    }

    async fn read(&self, document_id: &str) -> Result<Option<DocumentAggregate>> {
        let path = self.path_for(document_id);
        match fs::read(&path).await {
            Ok(data) => {
                let doc = serde_json::from_slice(&data)
                    .with_context(|| format!("cannot parse {}", path.display()))?;
                Ok(Some(doc))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("cannot read {}", path.display()))
            }
        }
    }

    async fn write(&self, doc: &DocumentAggregate) -> Result<()> {
        let path = self.path_for(&doc.document_id);
        let tmp = path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4()));
        let data = serde_json::to_vec_pretty(doc).context("cannot serialize record")?;
        fs::write(&tmp, data)
            .await
            .with_context(|| format!("cannot write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("cannot rename into {}", path.display()))
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn get(&self, document_id: &str) -> Result<Option<DocumentAggregate>, PipelineError> {
        self.read(document_id)
            .await
            .or_kind(ErrKind::StorageAccessError)
    }

    #[instrument(level = "trace", skip_all, fields(document_id = %page.document_id))]
    async fn upsert_page(&self, page: NewPage) -> Result<UpsertOutcome, PipelineError> {
        let _guard = self.write_lock.lock().await;
        let existing = self
            .read(&page.document_id)
            .await
            .or_kind(ErrKind::StorageAccessError)?;
        let outcome = apply_upsert(existing, page, self.clock.now());
        if outcome.appended {
            self.write(&outcome.aggregate)
                .await
                .or_kind(ErrKind::StorageAccessError)?;
        }
        Ok(outcome)
    }

    #[instrument(level = "trace", skip_all, fields(document_id = %document_id, expected = %expected, next = %next))]
    async fn conditional_transition(
        &self,
        document_id: &str,
        expected: DocumentStatus,
        next: DocumentStatus,
        mutator: Mutator<'_>,
    ) -> Result<DocumentAggregate, PipelineError> {
        let _guard = self.write_lock.lock().await;
        let current = self
            .read(document_id)
            .await
            .or_kind(ErrKind::StorageAccessError)?
            .ok_or_else(|| not_found(document_id))?;
        let updated = apply_transition(&current, expected, next, mutator, self.clock.now())?;
        self.write(&updated)
            .await
            .or_kind(ErrKind::StorageAccessError)?;
        Ok(updated)
    }

    async fn list(&self) -> Result<Vec<DocumentAggregate>, PipelineError> {
        async {
            let mut docs = vec![];
            let mut entries = fs::read_dir(&self.dir)
                .await
                .with_context(|| format!("cannot list {}", self.dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                let data = fs::read(&path)
                    .await
                    .with_context(|| format!("cannot read {}", path.display()))?;
                let doc: DocumentAggregate = serde_json::from_slice(&data)
                    .with_context(|| format!("cannot parse {}", path.display()))?;
                docs.push(doc);
            }
            docs.sort_by(|a, b| a.document_id.cmp(&b.document_id));
            Ok::<_, anyhow::Error>(docs)
        }
        .await
        .or_kind(ErrKind::StorageAccessError)
    }
}
