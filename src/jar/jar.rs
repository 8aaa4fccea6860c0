//! The [`CookieJar`]: durable per-object knowledge plus the dirty
//! queue with reservation semantics.
//!
//! ## Design
//! - Durable state (the enrichment log, a best-effort processing-state
//!   marker, a monotonic revision) lives behind a [`DocumentStore`].
//! - Ephemeral state (dirty / in-flight / redirty) lives in a
//!   [`DirtyQueue`](crate::jar::queue) guarded by one mutex + condvar.
//! - Appends for the same id serialize through a per-id lock table and
//!   use optimistic concurrency against the store revision, so
//!   concurrent enrichers observe each other's writes.
//!
//! ## Listeners
//! Dirty listeners fire after every `mark_dirty` that actually
//! transitions an id into `dirty`. Dispatch happens on a dedicated
//! thread so producers never block on a slow listener; invocations are
//! serialized and ordered consistently with the triggering
//! transitions. A panicking listener is caught and logged.
//!
//! ## Robustness
//! Every store traversal runs under the jar's [`RetryPolicy`]:
//! transient errors back off and retry without bound, while domain
//! errors (absent document, revision conflict) surface immediately —
//! conflicts are resolved here by re-reading and re-appending.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};

use crate::cookie::{Cookie, Enrichment};
use crate::errors::{JarError, QueueError, StoreError};
use crate::jar::locks::LockTable;
use crate::jar::queue::{DirtyQueue, QueueLength};
use crate::jar::retry::RetryPolicy;
use crate::jar::store::{CookieDocument, DocumentStoreHandle, ProcessingState};

/// Callback invoked with the id that just transitioned into `dirty`.
pub type DirtyListener = Box<dyn Fn(&str) + Send + 'static>;

/// Shared handle to a [`CookieJar`].
///
/// The jar is internally synchronized; all operations take `&self`.
pub type CookieJarHandle = Arc<CookieJar>;

pub struct CookieJar {
    store: DocumentStoreHandle,
    retry: RetryPolicy,
    queue: DirtyQueue,
    locks: LockTable,
    listeners: Arc<Mutex<Vec<DirtyListener>>>,
    listener_tx: Mutex<Option<mpsc::Sender<String>>>,
    listener_thread: Mutex<Option<JoinHandle<()>>>,
}

impl CookieJar {
    /// Opens a jar over `store` and recovers the dirty set.
    ///
    /// Every id whose persisted processing state is not `complete` is
    /// seeded into `dirty`, so work interrupted by a crash is retried
    /// on the next boot.
    pub fn open(store: DocumentStoreHandle, retry: RetryPolicy) -> Result<CookieJarHandle, JarError> {
        let listeners: Arc<Mutex<Vec<DirtyListener>>> = Arc::default();
        let (tx, rx) = mpsc::channel::<String>();

        let dispatcher = {
            let listeners = listeners.clone();
            thread::spawn(move || Self::dispatch(rx, &listeners))
        };

        let jar = Arc::new(Self {
            store,
            retry,
            queue: DirtyQueue::new(),
            locks: LockTable::new(),
            listeners,
            listener_tx: Mutex::new(Some(tx)),
            listener_thread: Mutex::new(Some(dispatcher)),
        });

        let mut recovered = 0usize;
        for (id, state) in jar.retry.run("scan", || jar.store.scan())? {
            if state != ProcessingState::Complete {
                jar.queue.mark_dirty(&id);
                recovered += 1;
            }
        }
        if recovered > 0 {
            debug!("recovered {recovered} unprocessed cookie(s) from the store");
        }

        Ok(jar)
    }

    fn dispatch(rx: mpsc::Receiver<String>, listeners: &Mutex<Vec<DirtyListener>>) {
        for id in rx {
            let listeners = listeners.lock().unwrap();
            for listener in listeners.iter() {
                if catch_unwind(AssertUnwindSafe(|| listener(&id))).is_err() {
                    error!("dirty listener panicked for cookie {id:?}");
                }
            }
        }
    }

    /// Registers a callback fired after each transition into `dirty`.
    pub fn add_listener(&self, listener: DirtyListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn emit_dirty(&self, id: &str) {
        if let Some(tx) = self.listener_tx.lock().unwrap().as_ref() {
            let _ = tx.send(id.to_string());
        }
    }

    /// Queue-only dirty transition; fires listeners when `id` actually
    /// entered `dirty`.
    fn queue_dirty(&self, id: &str) {
        if self.queue.mark_dirty(id) {
            self.emit_dirty(id);
        }
    }

    fn persist_state(&self, id: &str, state: ProcessingState) {
        let outcome = self
            .retry
            .run("set_processing_state", || self.store.set_processing_state(id, state));
        match outcome {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(e) => warn!("could not persist processing state for {id:?}: {e}"),
        }
    }

    /// Appends `enrichment` to `id`'s durable log and marks the object
    /// dirty. Unknown ids are created implicitly; this is how objects
    /// enter the system.
    pub fn enrich(&self, id: &str, enrichment: Enrichment) -> Result<(), JarError> {
        self.append(id, enrichment, true)?;
        self.queue_dirty(id);
        Ok(())
    }

    /// Appends `enrichment` without re-dirtying the object.
    ///
    /// Used for bookkeeping entries (rule-application logs) that must
    /// land in the durable log but must not trigger another processing
    /// pass. Fails with [`JarError::NotFound`] when the object no
    /// longer exists, so bookkeeping never resurrects a deleted cookie.
    pub fn annotate(&self, id: &str, enrichment: Enrichment) -> Result<(), JarError> {
        self.append(id, enrichment, false)
    }

    fn append(&self, id: &str, enrichment: Enrichment, dirty: bool) -> Result<(), JarError> {
        self.locks.with_lock(id, || loop {
            let existing = self.retry.run("get", || self.store.get(id))?;

            let (mut doc, expected) = match existing {
                Some(doc) => {
                    let expected = doc.revision;
                    (doc, Some(expected))
                }
                None if dirty => (CookieDocument::new(id), None),
                None => return Err(JarError::NotFound),
            };

            doc.enrichments.push(enrichment.clone());
            if dirty {
                doc.processing_state = ProcessingState::Dirty;
            }

            match self.retry.run("put", || self.store.put(&doc, expected)) {
                Ok(_) => return Ok(()),
                // Lost the race against another appender (or a delete);
                // re-read and try again.
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        })
    }

    /// Flags `id` as requiring (re)processing.
    ///
    /// No-op when already dirty. An in-flight id is re-queued after its
    /// current reservation is released.
    pub fn mark_dirty(&self, id: &str) {
        self.queue_dirty(id);
        self.persist_state(id, ProcessingState::Dirty);
    }

    /// Blocks until a dirty id can be reserved for processing.
    ///
    /// On success the id has moved into `in_flight` and belongs to the
    /// caller until `mark_complete`/`mark_failed`. A `timeout` of
    /// `None` waits indefinitely (until the queue is stopped).
    pub fn next_for_processing(&self, timeout: Option<Duration>) -> Result<String, QueueError> {
        let id = self.queue.reserve(timeout)?;
        self.persist_state(&id, ProcessingState::InFlight);
        Ok(id)
    }

    /// Reads the full cookie. `None` when the object is unknown.
    pub fn fetch(&self, id: &str) -> Result<Option<Cookie>, JarError> {
        let doc = self.retry.run("get", || self.store.get(id))?;
        Ok(doc.map(|doc| Cookie {
            id: doc.id,
            enrichments: doc.enrichments,
        }))
    }

    /// Removes the object's durable log and any pending queue
    /// membership. An in-flight reservation stays with its worker,
    /// whose next `fetch` observes the object as gone.
    pub fn delete(&self, id: &str) -> Result<(), JarError> {
        self.queue.remove(id);
        self.locks.with_lock(id, || {
            match self.retry.run("delete", || self.store.delete(id)) {
                Ok(()) => Ok(()),
                Err(StoreError::NotFound) => Err(JarError::NotFound),
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Releases `id`'s reservation after a successful pass. If the id
    /// was re-marked dirty while in flight, it transitions back into
    /// `dirty` here (and listeners fire accordingly).
    pub fn mark_complete(&self, id: &str) -> Result<(), JarError> {
        self.finish(id, false)
    }

    /// Releases `id`'s reservation after a failed pass; `requeue`
    /// forces the id back into `dirty` so processing is retried later.
    pub fn mark_failed(&self, id: &str, requeue: bool) -> Result<(), JarError> {
        self.finish(id, requeue)
    }

    fn finish(&self, id: &str, force_requeue: bool) -> Result<(), JarError> {
        let requeued = self.queue.release(id, force_requeue)?;
        if requeued {
            self.emit_dirty(id);
            self.persist_state(id, ProcessingState::Dirty);
        } else {
            self.persist_state(id, ProcessingState::Complete);
        }
        Ok(())
    }

    /// Current queue population.
    pub fn length(&self) -> QueueLength {
        self.queue.length()
    }

    /// Stops the dirty queue: all current and future
    /// `next_for_processing` calls return [`QueueError::Stopped`].
    /// Reads and writes keep working.
    pub fn stop(&self) {
        self.queue.stop();
    }
}

impl Drop for CookieJar {
    fn drop(&mut self) {
        // Closing the channel ends the dispatcher loop.
        self.listener_tx.lock().unwrap().take();
        if let Some(handle) = self.listener_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
