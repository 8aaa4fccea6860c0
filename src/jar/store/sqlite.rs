//! SQLite-backed document store.
//!
//! `SqliteDocumentStore` persists **all** cookies in a single SQLite
//! database and implements the [`DocumentStore`] trait, including the
//! compare-and-swap revision contract used for optimistic-concurrency
//! appends.
//!
//! ## Design
//! - One **table** (`cookies`); each row is a full per-object document.
//! - The enrichment log is stored as a JSON array in insertion order.
//! - `revision` is bumped by every write; CAS updates guard on it in
//!   the `WHERE` clause, so conflicting appenders retry at the jar
//!   layer rather than interleaving.
//! - Database access is via an `r2d2` pool for safe multi-threaded use.
//!
//! ## Error mapping
//! - Pool/connection/SQL failures → [`StoreError::Unavailable`]
//!   (retried by the jar's retry policy).
//! - Undecodable rows → [`StoreError::Corrupt`] (never retried).
//! - Missing rows and revision mismatches → `NotFound` / `Conflict`.

use std::path::PathBuf;
use std::sync::Arc;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::rusqlite::{params, OptionalExtension};
use r2d2_sqlite::SqliteConnectionManager;

use crate::cookie::EnrichmentCollection;
use crate::errors::StoreError;
use crate::jar::store::{CookieDocument, DocumentStore, ProcessingState};

/// A SQLite-based document store that persists cookies across restarts.
pub struct SqliteDocumentStore {
    /// Connection pool for the SQLite database (so it can run multithreaded)
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteDocumentStore {
    /// Opens (or creates) a SQLite database at `path` and ensures the
    /// schema exists.
    pub fn open(path: PathBuf) -> Result<Arc<Self>, StoreError> {
        let pool = Pool::new(SqliteConnectionManager::file(path)).map_err(unavailable)?;
        Self::with_pool(pool)
    }

    /// Opens a private in-memory database. Mainly useful in tests.
    ///
    /// The pool is capped at one connection: each `:memory:` connection
    /// would otherwise see its own independent database.
    pub fn open_in_memory() -> Result<Arc<Self>, StoreError> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())
            .map_err(unavailable)?;
        Self::with_pool(pool)
    }

    fn with_pool(pool: Pool<SqliteConnectionManager>) -> Result<Arc<Self>, StoreError> {

        {
            let conn = pool.get().map_err(unavailable)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS cookies (
                    id TEXT NOT NULL PRIMARY KEY,
                    enrichments TEXT NOT NULL,
                    processing_state TEXT NOT NULL,
                    revision INTEGER NOT NULL
                );",
            )
            .map_err(unavailable)?;
        }

        Ok(Arc::new(Self { pool }))
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        self.pool.get().map_err(unavailable)
    }
}

fn unavailable(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn decode_row(
    id: String,
    enrichments: String,
    state: String,
    revision: i64,
) -> Result<CookieDocument, StoreError> {
    let enrichments: EnrichmentCollection = serde_json::from_str(&enrichments)
        .map_err(|e| StoreError::Corrupt(format!("enrichment log for {id:?}: {e}")))?;
    let processing_state = ProcessingState::parse(&state)
        .ok_or_else(|| StoreError::Corrupt(format!("processing state {state:?} for {id:?}")))?;

    Ok(CookieDocument {
        id,
        enrichments,
        processing_state,
        revision: revision as u64,
    })
}

impl DocumentStore for SqliteDocumentStore {
    fn get(&self, id: &str) -> Result<Option<CookieDocument>, StoreError> {
        let conn = self.conn()?;

        let row = conn
            .query_row(
                "SELECT id, enrichments, processing_state, revision
                 FROM cookies WHERE id = ?1",
                [id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(unavailable)?;

        row.map(|(id, enrichments, state, revision)| decode_row(id, enrichments, state, revision))
            .transpose()
    }

    fn put(&self, doc: &CookieDocument, expected_revision: Option<u64>) -> Result<u64, StoreError> {
        let conn = self.conn()?;
        let enrichments = serde_json::to_string(&doc.enrichments)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        match expected_revision {
            None => {
                let inserted = conn
                    .execute(
                        "INSERT OR IGNORE INTO cookies (id, enrichments, processing_state, revision)
                         VALUES (?1, ?2, ?3, 1)",
                        params![doc.id, enrichments, doc.processing_state.as_str()],
                    )
                    .map_err(unavailable)?;
                if inserted == 0 {
                    return Err(StoreError::Conflict);
                }
                Ok(1)
            }
            Some(expected) => {
                let updated = conn
                    .execute(
                        "UPDATE cookies
                         SET enrichments = ?2, processing_state = ?3, revision = revision + 1
                         WHERE id = ?1 AND revision = ?4",
                        params![
                            doc.id,
                            enrichments,
                            doc.processing_state.as_str(),
                            expected as i64
                        ],
                    )
                    .map_err(unavailable)?;
                if updated == 0 {
                    // Stale revision, or the row vanished underneath us.
                    // Either way the caller must re-read.
                    return Err(StoreError::Conflict);
                }
                Ok(expected + 1)
            }
        }
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let deleted = conn
            .execute("DELETE FROM cookies WHERE id = ?1", [id])
            .map_err(unavailable)?;
        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(String, ProcessingState)>, StoreError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare("SELECT id, processing_state FROM cookies")
            .map_err(unavailable)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(unavailable)?;

        let mut out = Vec::new();
        for row in rows {
            let (id, state) = row.map_err(unavailable)?;
            let state = ProcessingState::parse(&state).ok_or_else(|| {
                StoreError::Corrupt(format!("processing state {state:?} for {id:?}"))
            })?;
            out.push((id, state));
        }
        Ok(out)
    }

    fn set_processing_state(&self, id: &str, state: ProcessingState) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE cookies SET processing_state = ?2, revision = revision + 1
                 WHERE id = ?1",
                params![id, state.as_str()],
            )
            .map_err(unavailable)?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::Enrichment;
    use serde_json::Map;

    fn store() -> Arc<SqliteDocumentStore> {
        SqliteDocumentStore::open_in_memory().unwrap()
    }

    #[test]
    fn documents_survive_a_round_trip() {
        let store = store();

        let mut doc = CookieDocument::new("/a/1");
        doc.enrichments.push(Enrichment::now("irods", Map::new()));
        let rev = store.put(&doc, None).unwrap();

        let got = store.get("/a/1").unwrap().unwrap();
        assert_eq!(got.revision, rev);
        assert_eq!(got.enrichments.len(), 1);
        assert_eq!(got.enrichments.last().unwrap().source, "irods");
    }

    #[test]
    fn cas_update_detects_stale_revision() {
        let store = store();
        let doc = CookieDocument::new("/a/1");
        let rev = store.put(&doc, None).unwrap();

        assert_eq!(store.put(&doc, Some(rev)).unwrap(), rev + 1);
        assert!(matches!(
            store.put(&doc, Some(rev)),
            Err(StoreError::Conflict)
        ));
    }

    #[test]
    fn scan_reports_persisted_states() {
        let store = store();

        let mut complete = CookieDocument::new("/done");
        complete.processing_state = ProcessingState::Complete;
        store.put(&complete, None).unwrap();
        store.put(&CookieDocument::new("/pending"), None).unwrap();

        let mut seen = store.scan().unwrap();
        seen.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            seen,
            vec![
                ("/done".to_string(), ProcessingState::Complete),
                ("/pending".to_string(), ProcessingState::Dirty),
            ]
        );
    }

    #[test]
    fn set_processing_state_keeps_the_log_intact() {
        let store = store();

        let mut doc = CookieDocument::new("/a/1");
        doc.enrichments.push(Enrichment::now("irods", Map::new()));
        store.put(&doc, None).unwrap();

        store
            .set_processing_state("/a/1", ProcessingState::Complete)
            .unwrap();

        let got = store.get("/a/1").unwrap().unwrap();
        assert_eq!(got.processing_state, ProcessingState::Complete);
        assert_eq!(got.enrichments.len(), 1);
    }
}
