//! Per-object lock table.
//!
//! Concurrent `enrich` calls for the same id must serialize so that
//! their read-modify-write appends observe each other. The table hands
//! out one mutex per live id and garbage-collects entries once nobody
//! holds them.
//!
//! Entry creation, lookup, and GC each happen **under the table lock**,
//! so the table mutation itself is atomic; acquiring an id's mutex
//! happens after the table lock is released so unrelated ids never
//! contend with each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub(crate) struct LockTable {
    entries: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the lock for `id`.
    pub fn with_lock<R>(&self, id: &str, f: impl FnOnce() -> R) -> R {
        let slot = {
            let mut entries = self.entries.lock().unwrap();
            entries.entry(id.to_string()).or_default().clone()
        };

        let out = {
            let _held = slot.lock().unwrap();
            f()
        };

        drop(slot);
        self.collect(id);
        out
    }

    /// Drops the entry for `id` if the table holds the only reference.
    ///
    /// Safe against races with `with_lock`: a new acquisition also runs
    /// under the table lock, so the uniqueness check cannot interleave
    /// with an entry being handed out.
    fn collect(&self, id: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(slot) = entries.get(id) {
            if Arc::strong_count(slot) == 1 {
                entries.remove(id);
            }
        }
    }

    #[cfg(test)]
    fn live_entries(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn entries_are_collected_after_use() {
        let table = LockTable::new();

        table.with_lock("/a/1", || {});
        assert_eq!(table.live_entries(), 0);
    }

    #[test]
    fn same_id_serializes_critical_sections() {
        let table = Arc::new(LockTable::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                let inside = inside.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        table.with_lock("/shared", || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(table.live_entries(), 0);
    }

    #[test]
    fn different_ids_do_not_share_a_lock() {
        let table = Arc::new(LockTable::new());

        // Hold one id's lock on another thread; a different id must
        // still be acquirable without blocking on it.
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let t = {
            let table = table.clone();
            thread::spawn(move || {
                table.with_lock("/a", || {
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                });
            })
        };

        started_rx.recv().unwrap();
        table.with_lock("/b", || {});
        release_tx.send(()).unwrap();
        t.join().unwrap();
    }
}
