//! In-memory object storage for tests.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex,
};

use crate::prelude::*;

use super::ObjectStore;

/// Objects held in a map. Locations can be marked as denied to simulate
/// permission errors.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    denied: Mutex<HashSet<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation touching `location` fail with access denied.
    pub fn deny(&self, location: &str) {
        self.denied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(location.to_owned());
    }

    /// Does an object exist?
    pub fn contains(&self, location: &str) -> bool {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(location)
    }

    /// All object locations, sorted.
    pub fn locations(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn check(&self, location: &str) -> Result<(), PipelineError> {
        let denied = self.denied.lock().unwrap_or_else(|e| e.into_inner());
        if denied.contains(location) {
            return Err(PipelineError::new(
                ErrKind::StorageAccessError,
                format!("AccessDenied: {location}"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, location: &str, data: Vec<u8>) -> Result<(), PipelineError> {
        self.check(location)?;
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(location.to_owned(), data);
        Ok(())
    }

    async fn get(&self, location: &str) -> Result<Vec<u8>, PipelineError> {
        self.check(location)?;
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(location)
            .cloned()
            .ok_or_else(|| {
                PipelineError::new(
                    ErrKind::StorageAccessError,
                    format!("NoSuchKey: {location}"),
                )
            })
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), PipelineError> {
        let data = self.get(from).await?;
        self.put(to, data).await
    }

    async fn delete(&self, location: &str) -> Result<(), PipelineError> {
        self.check(location)?;
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(location);
        Ok(())
    }
}
