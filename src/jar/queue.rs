//! The in-memory dirty queue.
//!
//! Tracks which object ids need (re)processing and which are reserved
//! by a worker right now. The core contract:
//!
//! - `dirty` is a **set with FIFO order**: marking an already-dirty id
//!   is a no-op that keeps its queue position.
//! - An id moves from `dirty` to `in_flight` when reserved; at most one
//!   worker holds a given id's reservation at any instant.
//! - Marking an in-flight id dirty lands it in `redirty`; on release it
//!   re-enters `dirty` exactly once, regardless of how the flight
//!   ended.
//!
//! All state is guarded by a single mutex with a condvar on `dirty`;
//! consumers block in [`DirtyQueue::reserve`] until work arrives, the
//! optional deadline elapses, or the queue is stopped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::errors::{JarError, QueueError};

/// Snapshot of the queue's population, as reported by `length()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueLength {
    pub dirty: usize,
    pub in_flight: usize,
}

impl QueueLength {
    pub fn total(self) -> usize {
        self.dirty + self.in_flight
    }
}

#[derive(Default)]
struct QueueState {
    dirty: VecDeque<String>,
    dirty_set: HashSet<String>,
    in_flight: HashMap<String, Instant>,
    redirty: HashSet<String>,
    stopped: bool,
}

#[derive(Default)]
pub(crate) struct DirtyQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl DirtyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `id` as requiring processing.
    ///
    /// Returns `true` when the id actually transitioned into `dirty`
    /// (the caller fires listeners on that transition only). In-flight
    /// ids are parked in `redirty` instead and requeued on release.
    pub fn mark_dirty(&self, id: &str) -> bool {
        let mut state = self.state.lock().unwrap();

        if state.in_flight.contains_key(id) {
            state.redirty.insert(id.to_string());
            return false;
        }
        if state.dirty_set.contains(id) {
            return false;
        }

        state.dirty.push_back(id.to_string());
        state.dirty_set.insert(id.to_string());
        self.available.notify_one();
        true
    }

    /// Blocks until a dirty id can be reserved, then moves it into
    /// `in_flight` and returns it. FIFO by dirty-transition time.
    pub fn reserve(&self, timeout: Option<Duration>) -> Result<String, QueueError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();

        loop {
            if state.stopped {
                return Err(QueueError::Stopped);
            }

            if let Some(id) = state.dirty.pop_front() {
                state.dirty_set.remove(&id);
                state.in_flight.insert(id.clone(), Instant::now());
                return Ok(id);
            }

            state = match deadline {
                None => self.available.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(QueueError::Timeout);
                    }
                    self.available.wait_timeout(state, deadline - now).unwrap().0
                }
            };
        }
    }

    /// Releases `id`'s reservation.
    ///
    /// Returns `true` when the id transitioned back into `dirty` —
    /// because it was re-marked while in flight, or because the caller
    /// forced a requeue (failure handling).
    pub fn release(&self, id: &str, force_requeue: bool) -> Result<bool, JarError> {
        let mut state = self.state.lock().unwrap();

        state
            .in_flight
            .remove(id)
            .ok_or_else(|| JarError::NotReserved(id.to_string()))?;

        let redirtied = state.redirty.remove(id);
        if (redirtied || force_requeue) && !state.dirty_set.contains(id) {
            state.dirty.push_back(id.to_string());
            state.dirty_set.insert(id.to_string());
            self.available.notify_one();
            return Ok(true);
        }

        Ok(false)
    }

    /// Forgets any pending work for `id` (object deleted).
    ///
    /// An existing reservation is left with its worker; the worker's
    /// release clears it.
    pub fn remove(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        if state.dirty_set.remove(id) {
            state.dirty.retain(|d| d != id);
        }
        state.redirty.remove(id);
    }

    pub fn length(&self) -> QueueLength {
        let state = self.state.lock().unwrap();
        QueueLength {
            dirty: state.dirty.len(),
            in_flight: state.in_flight.len(),
        }
    }

    /// Stops the queue: every current and future `reserve` returns
    /// [`QueueError::Stopped`].
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        self.available.notify_all();
    }
}
