//! Object storage for page files, extracted text and results.
//!
//! Objects are addressed by opaque location strings such as
//! `incoming/inv-1_1.jpg` or `staging/inv-1/text_page_1.txt`.

use crate::prelude::*;

pub mod fs;
#[cfg(test)]
pub mod memory;

/// Where intermediate and result objects for a document are written.
pub mod layout {
    /// Extracted text for one page.
    pub fn page_text(document_id: &str, page_index: u32) -> String {
        format!("staging/{document_id}/text_page_{page_index}.txt")
    }

    /// Combined text for the whole document.
    pub fn combined_text(document_id: &str) -> String {
        format!("staging/{document_id}/combined.txt")
    }

    /// Combined text with PII masked.
    pub fn redacted_text(document_id: &str) -> String {
        format!("staging/{document_id}/combined_redacted.txt")
    }

    /// PII analysis document.
    pub fn pii_analysis(document_id: &str) -> String {
        format!("pii-results/{document_id}_pii_analysis.json")
    }

    /// Classification results.
    pub fn classification_result(document_id: &str) -> String {
        format!("results/{document_id}_response.json")
    }

    /// Final home of a source file.
    pub fn completed(complete_prefix: &str, document_id: &str, filename: &str) -> String {
        format!("{complete_prefix}{document_id}/{filename}")
    }

    /// Where expanded archives are moved.
    pub fn archived(filename: &str) -> String {
        format!("archive/{filename}")
    }
}

/// A store of byte objects.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Write an object, replacing any existing one.
    async fn put(&self, location: &str, data: Vec<u8>) -> Result<(), PipelineError>;

    /// Read an object.
    async fn get(&self, location: &str) -> Result<Vec<u8>, PipelineError>;

    /// Copy an object.
    async fn copy(&self, from: &str, to: &str) -> Result<(), PipelineError>;

    /// Delete an object.
    async fn delete(&self, location: &str) -> Result<(), PipelineError>;

    /// Move an object. The default copies, then deletes.
    async fn move_object(&self, from: &str, to: &str) -> Result<(), PipelineError> {
        self.copy(from, to).await?;
        self.delete(from).await
    }

    /// Read an object as UTF-8 text.
    async fn get_text(&self, location: &str) -> Result<String, PipelineError> {
        let data = self.get(location).await?;
        String::from_utf8(data).map_err(|err| {
            PipelineError::new(
                ErrKind::StorageAccessError,
                format!("{location} is not valid UTF-8: {err}"),
            )
        })
    }

    /// Write UTF-8 text.
    async fn put_text(&self, location: &str, text: &str) -> Result<(), PipelineError> {
        self.put(location, text.as_bytes().to_vec()).await
    }

    /// Write pretty-printed JSON.
    async fn put_json(&self, location: &str, value: &Value) -> Result<(), PipelineError> {
        let data = serde_json::to_vec_pretty(value)
            .context("cannot serialize JSON")
            .or_kind(ErrKind::Unknown)?;
        self.put(location, data).await
    }
}
