//! The worker pool draining the dirty queue.
//!
//! [`ProcessorManager`] owns N OS worker threads. Each worker blocks in
//! `next_for_processing`, runs one processing pass over the reserved
//! cookie, and releases the reservation — `mark_complete` on success
//! (the jar's redirty machinery requeues cookies that gained knowledge
//! mid-flight), `mark_failed(requeue)` when the pass errored or
//! panicked, so processing is retried later.
//!
//! Workers are woken promptly by the jar's listener fan-out firing
//! after each dirty transition; the `next_for_processing` timeout is
//! only the fallback heartbeat. Shutdown is cooperative: `stop()` sets
//! a flag, stops the queue (which unblocks every waiter), and joins the
//! workers; a worker mid-cookie finishes that cookie first.
//!
//! For debugging, every worker reports `(id, state, last cookie, stack
//! sketch)` via [`ProcessorManager::dump_threads`]; the number of
//! workers currently waiting for a cookie is available as a gauge.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::errors::{JarError, QueueError};
use crate::jar::CookieJarHandle;
use crate::notifier::Notifier;
use crate::processor::processor::{process, Outcome};
use crate::registry::{LoaderRegistry, RuleRegistry};

/// What a worker is doing right now.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    AwaitingCookie,
    Processing {
        cookie: String,
        #[serde(with = "time::serde::rfc3339")]
        since: OffsetDateTime,
    },
}

/// Point-in-time report for one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerDump {
    pub worker_id: Uuid,
    #[serde(flatten)]
    pub state: WorkerState,
    pub last_cookie: Option<String>,
    pub stack_sketch: Vec<String>,
}

struct WorkerStatus {
    worker_id: Uuid,
    state: WorkerState,
    last_cookie: Option<String>,
    sketch: Vec<String>,
}

impl WorkerStatus {
    fn dump(&self) -> WorkerDump {
        WorkerDump {
            worker_id: self.worker_id,
            state: self.state.clone(),
            last_cookie: self.last_cookie.clone(),
            stack_sketch: self.sketch.clone(),
        }
    }
}

struct Shared {
    jar: CookieJarHandle,
    rules: Arc<RuleRegistry>,
    loaders: Arc<LoaderRegistry>,
    notifier: Arc<Notifier>,
    poll_timeout: Duration,
    stopping: AtomicBool,
    awaiting: AtomicUsize,
}

/// Coordinates N workers against one jar's dirty queue.
pub struct ProcessorManager {
    shared: Arc<Shared>,
    statuses: Mutex<Vec<Arc<Mutex<WorkerStatus>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessorManager {
    /// `poll_timeout` bounds each wait in `next_for_processing`; a
    /// timeout is a benign wakeup, after which the worker retries.
    pub fn new(
        jar: CookieJarHandle,
        rules: Arc<RuleRegistry>,
        loaders: Arc<LoaderRegistry>,
        notifier: Arc<Notifier>,
        poll_timeout: Duration,
    ) -> Arc<Self> {
        // The queue's condvar is signalled by mark_dirty itself; this
        // listener is the observability hook on the same transition.
        // It runs on the jar's dispatch thread, never on a producer.
        jar.add_listener(Box::new(|id| {
            trace!("dirty transition for cookie {id:?}");
        }));

        Arc::new(Self {
            shared: Arc::new(Shared {
                jar,
                rules,
                loaders,
                notifier,
                poll_timeout,
                stopping: AtomicBool::new(false),
                awaiting: AtomicUsize::new(0),
            }),
            statuses: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawns `count` worker threads.
    pub fn start(&self, count: usize) {
        let mut statuses = self.statuses.lock().unwrap();
        let mut workers = self.workers.lock().unwrap();

        for _ in 0..count {
            let status = Arc::new(Mutex::new(WorkerStatus {
                worker_id: Uuid::new_v4(),
                state: WorkerState::Idle,
                last_cookie: None,
                sketch: Vec::new(),
            }));
            statuses.push(status.clone());

            let shared = self.shared.clone();
            let worker_id = status.lock().unwrap().worker_id;
            let handle = thread::Builder::new()
                .name(format!("cookie-worker-{worker_id}"))
                .spawn(move || worker_loop(&shared, &status))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        info!("started {count} cookie worker(s)");
    }

    /// Cooperative shutdown: flags the workers, stops the jar's queue
    /// (waking every blocked waiter), and joins. Workers holding a
    /// reservation finish their current cookie before exiting.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.jar.stop();

        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        info!("all cookie workers stopped");
    }

    /// Per-worker state for debugging.
    pub fn dump_threads(&self) -> Vec<WorkerDump> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.lock().unwrap().dump())
            .collect()
    }

    /// Number of workers currently blocked waiting for a cookie.
    pub fn awaiting_cookie_count(&self) -> usize {
        self.shared.awaiting.load(Ordering::SeqCst)
    }
}

fn set_status(status: &Mutex<WorkerStatus>, state: WorkerState, sketch: &[&str]) {
    let mut status = status.lock().unwrap();
    status.state = state;
    status.sketch = sketch.iter().map(|s| s.to_string()).collect();
}

fn worker_loop(shared: &Shared, status: &Mutex<WorkerStatus>) {
    while !shared.stopping.load(Ordering::SeqCst) {
        set_status(
            status,
            WorkerState::AwaitingCookie,
            &["worker_loop", "next_for_processing"],
        );
        shared.awaiting.fetch_add(1, Ordering::SeqCst);
        let next = shared.jar.next_for_processing(Some(shared.poll_timeout));
        shared.awaiting.fetch_sub(1, Ordering::SeqCst);

        let id = match next {
            Ok(id) => id,
            Err(QueueError::Timeout) => continue,
            Err(QueueError::Stopped) => break,
        };

        set_status(
            status,
            WorkerState::Processing {
                cookie: id.clone(),
                since: OffsetDateTime::now_utc(),
            },
            &["worker_loop", "process"],
        );

        let pass = catch_unwind(AssertUnwindSafe(|| handle_one(shared, &id)));
        match pass {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("processing {id:?} failed: {e}; requeueing");
                release_failed(shared, &id);
            }
            Err(_) => {
                error!("worker panicked while processing {id:?}; requeueing");
                release_failed(shared, &id);
            }
        }

        {
            let mut status = status.lock().unwrap();
            status.state = WorkerState::Idle;
            status.last_cookie = Some(id);
            status.sketch = vec!["worker_loop".to_string()];
        }
    }

    set_status(status, WorkerState::Idle, &[]);
    debug!("worker exiting");
}

fn release_failed(shared: &Shared, id: &str) {
    if let Err(e) = shared.jar.mark_failed(id, true) {
        error!("could not release reservation for {id:?}: {e}");
    }
}

fn handle_one(shared: &Shared, id: &str) -> Result<(), JarError> {
    let cookie = match shared.jar.fetch(id)? {
        Some(cookie) => cookie,
        None => {
            debug!("cookie {id:?} vanished before processing");
            return shared.jar.mark_complete(id);
        }
    };

    let rules = shared.rules.snapshot();
    let loaders = shared.loaders.snapshot();
    let outcome = process(&shared.jar, &cookie, &rules, &loaders, &shared.notifier)?;

    match &outcome {
        Outcome::Completed => debug!("cookie {id:?} completed"),
        Outcome::NeedsEnrichment(loader) => {
            debug!("cookie {id:?} enriched by {loader:?}; will be requeued")
        }
        Outcome::Unprocessable => debug!("cookie {id:?} is unprocessable for now"),
    }

    // Every outcome releases the reservation the same way: an
    // enrichment appended mid-flight has parked the id in redirty, and
    // release moves it back into the dirty queue.
    shared.jar.mark_complete(id)
}
