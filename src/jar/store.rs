mod in_memory;
#[cfg(feature = "sqlite_store")]
mod sqlite;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cookie::EnrichmentCollection;
use crate::errors::StoreError;

pub use in_memory::InMemoryDocumentStore;
#[cfg(feature = "sqlite_store")]
pub use sqlite::SqliteDocumentStore;

/// Best-effort processing marker persisted alongside each document.
///
/// Only consulted during boot recovery; during normal operation the
/// authoritative dirty state lives in the jar's in-memory queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Complete,
    Dirty,
    InFlight,
}

impl ProcessingState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingState::Complete => "complete",
            ProcessingState::Dirty => "dirty",
            ProcessingState::InFlight => "in_flight",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(ProcessingState::Complete),
            "dirty" => Some(ProcessingState::Dirty),
            "in_flight" => Some(ProcessingState::InFlight),
            _ => None,
        }
    }
}

/// The per-object document as persisted by a [`DocumentStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CookieDocument {
    pub id: String,

    /// Enrichments in insertion order. Append-only: no store operation
    /// ever mutates or reorders recorded entries.
    pub enrichments: EnrichmentCollection,

    pub processing_state: ProcessingState,

    /// Monotonic revision maintained by the store, used for
    /// optimistic-concurrency writes.
    #[serde(default)]
    pub revision: u64,
}

impl CookieDocument {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enrichments: EnrichmentCollection::new(),
            processing_state: ProcessingState::Dirty,
            revision: 0,
        }
    }
}

// The document database behind the jar. Implementations manage their own
// synchronization; trait methods take &self.
pub trait DocumentStore: Send + Sync {
    /// Reads the full document for `id`, or `None` when absent.
    fn get(&self, id: &str) -> Result<Option<CookieDocument>, StoreError>;

    /// Writes `doc` and returns the new revision.
    ///
    /// With `expected_revision = None` this is an insert and fails with
    /// [`StoreError::Conflict`] when the id already exists. Otherwise it
    /// is a compare-and-swap update that fails with `Conflict` when the
    /// stored revision no longer matches.
    fn put(&self, doc: &CookieDocument, expected_revision: Option<u64>) -> Result<u64, StoreError>;

    /// Removes the document. [`StoreError::NotFound`] when absent.
    fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Lists every known id with its persisted processing state.
    /// Used once, at jar boot, to recover the dirty set after a crash.
    fn scan(&self) -> Result<Vec<(String, ProcessingState)>, StoreError>;

    /// Overwrites the processing-state attribute without touching the
    /// enrichment log. [`StoreError::NotFound`] when absent.
    fn set_processing_state(&self, id: &str, state: ProcessingState) -> Result<(), StoreError>;
}

/// Shared handle to a type-erased [`DocumentStore`].
pub type DocumentStoreHandle = Arc<dyn DocumentStore>;
