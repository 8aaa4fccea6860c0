use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::errors::StoreError;
use crate::jar::store::{CookieDocument, DocumentStore, ProcessingState};

/// In-memory document store.
///
/// The reference backend for tests and embedded use. Supports the same
/// optimistic-concurrency contract as the durable backends, plus
/// failure injection (`fail_next`) so retry behaviour can be exercised
/// without a real database.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    docs: RwLock<HashMap<String, CookieDocument>>,
    /// Number of upcoming operations that should fail as transient.
    failures: AtomicUsize,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` store operations fail with
    /// [`StoreError::Unavailable`].
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn check_outage(&self) -> Result<(), StoreError> {
        let prev = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if prev > 0 {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn get(&self, id: &str) -> Result<Option<CookieDocument>, StoreError> {
        self.check_outage()?;
        Ok(self.docs.read().unwrap().get(id).cloned())
    }

    fn put(&self, doc: &CookieDocument, expected_revision: Option<u64>) -> Result<u64, StoreError> {
        self.check_outage()?;
        let mut docs = self.docs.write().unwrap();

        match (docs.get(&doc.id), expected_revision) {
            (Some(_), None) => Err(StoreError::Conflict),
            (Some(existing), Some(expected)) if existing.revision != expected => {
                Err(StoreError::Conflict)
            }
            (None, Some(_)) => Err(StoreError::Conflict),
            (existing, _) => {
                let revision = existing.map_or(0, |d| d.revision) + 1;
                let mut stored = doc.clone();
                stored.revision = revision;
                docs.insert(doc.id.clone(), stored);
                Ok(revision)
            }
        }
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.check_outage()?;
        self.docs
            .write()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    fn scan(&self) -> Result<Vec<(String, ProcessingState)>, StoreError> {
        self.check_outage()?;
        Ok(self
            .docs
            .read()
            .unwrap()
            .values()
            .map(|d| (d.id.clone(), d.processing_state))
            .collect())
    }

    fn set_processing_state(&self, id: &str, state: ProcessingState) -> Result<(), StoreError> {
        self.check_outage()?;
        let mut docs = self.docs.write().unwrap();
        let doc = docs.get_mut(id).ok_or(StoreError::NotFound)?;
        doc.processing_state = state;
        doc.revision += 1;
        Ok(())
    }
}
