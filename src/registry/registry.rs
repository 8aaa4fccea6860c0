//! The priority-ordered registry.
//!
//! A [`Registry`] holds the live set of plug-in items of one kind
//! (rules, enrichment loaders, or notification receivers) and exposes
//! point-in-time [`Snapshot`]s sorted by descending priority, ties
//! broken by registration order.
//!
//! Items are attributed to the plug-in file they were loaded from, so a
//! modified or deleted file can drop exactly its own items; the
//! remove-and-replace on reload happens under a single write-lock
//! acquisition and is therefore observed atomically by readers. Writers
//! run on the watcher thread; readers only ever take the read lock.

use std::any::Any;
use std::collections::HashSet;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::debug;

use crate::registry::watcher::LoadedPlugin;
use crate::rules::{EnrichmentLoader, NotificationReceiver, Rule};

/// What a registry needs to know about the items it orders.
///
/// `registry_id` is `Some` for item kinds with identifier uniqueness
/// (rules, loaders): re-registering an id replaces the prior item.
/// Receivers have no id and register by identity.
pub trait RegistryItem: Send + Sync {
    fn registry_id(&self) -> Option<&str> {
        None
    }

    fn priority(&self) -> i32 {
        0
    }
}

impl RegistryItem for dyn Rule {
    fn registry_id(&self) -> Option<&str> {
        Some(Rule::id(self))
    }

    fn priority(&self) -> i32 {
        Rule::priority(self)
    }
}

impl RegistryItem for dyn EnrichmentLoader {
    fn registry_id(&self) -> Option<&str> {
        Some(EnrichmentLoader::id(self))
    }

    fn priority(&self) -> i32 {
        EnrichmentLoader::priority(self)
    }
}

impl RegistryItem for dyn NotificationReceiver {}

/// Registry of production rules.
pub type RuleRegistry = Registry<dyn Rule>;

/// Registry of enrichment loaders.
pub type LoaderRegistry = Registry<dyn EnrichmentLoader>;

/// Registry of notification receivers.
pub type ReceiverRegistry = Registry<dyn NotificationReceiver>;

struct Entry<T: ?Sized> {
    item: Arc<T>,
    origin: Option<PathBuf>,
    seq: u64,
    /// Guard keeping the item's backing code (a loaded shared object)
    /// alive for as long as the item is registered or snapshotted.
    keep_alive: Option<Arc<dyn Any + Send + Sync>>,
}

struct State<T: ?Sized> {
    entries: Vec<Entry<T>>,
    next_seq: u64,
}

pub struct Registry<T: RegistryItem + ?Sized> {
    /// Kind label used in log lines ("rules", "loaders", ...).
    kind: &'static str,
    inner: RwLock<State<T>>,
}

impl<T: RegistryItem + ?Sized> Registry<T> {
    pub fn new(kind: &'static str) -> Arc<Self> {
        Arc::new(Self {
            kind,
            inner: RwLock::new(State {
                entries: Vec::new(),
                next_seq: 0,
            }),
        })
    }

    /// Registers `item` programmatically (no file attribution).
    pub fn register(&self, item: Arc<T>) {
        let mut state = self.inner.write().unwrap();
        Self::insert(self.kind, &mut state, item, None, None);
    }

    fn insert(
        kind: &str,
        state: &mut State<T>,
        item: Arc<T>,
        origin: Option<PathBuf>,
        keep_alive: Option<Arc<dyn Any + Send + Sync>>,
    ) {
        if let Some(id) = item.registry_id() {
            if let Some(pos) = state
                .entries
                .iter()
                .position(|e| e.item.registry_id() == Some(id))
            {
                debug!("{kind}: replacing previously registered item {id:?}");
                state.entries.remove(pos);
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(Entry {
            item,
            origin,
            seq,
            keep_alive,
        });
    }

    /// Replaces every item attributed to `path` with the freshly loaded
    /// set, as one atomic swap from readers' point of view.
    pub fn install_file(&self, path: &Path, plugin: LoadedPlugin<T>) {
        let mut state = self.inner.write().unwrap();
        state.entries.retain(|e| e.origin.as_deref() != Some(path));
        for item in plugin.items {
            Self::insert(
                self.kind,
                &mut state,
                item,
                Some(path.to_path_buf()),
                plugin.keep_alive.clone(),
            );
        }
    }

    /// Drops every item attributed to `path`. Returns how many were
    /// removed.
    pub fn remove_file(&self, path: &Path) -> usize {
        let mut state = self.inner.write().unwrap();
        let before = state.entries.len();
        state.entries.retain(|e| e.origin.as_deref() != Some(path));
        before - state.entries.len()
    }

    /// The files that currently have items attributed to them.
    pub fn files(&self) -> HashSet<PathBuf> {
        let state = self.inner.read().unwrap();
        state
            .entries
            .iter()
            .filter_map(|e| e.origin.clone())
            .collect()
    }

    /// Point-in-time view of the registered items, priority descending,
    /// ties by registration order. Concurrent mutation does not affect
    /// an already-taken snapshot.
    pub fn snapshot(&self) -> Snapshot<T> {
        let state = self.inner.read().unwrap();

        let mut ordered: Vec<(i32, u64, &Entry<T>)> = state
            .entries
            .iter()
            .map(|e| (e.item.priority(), e.seq, e))
            .collect();
        ordered.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut keep_alive = Vec::new();
        let items = ordered
            .into_iter()
            .map(|(_, _, e)| {
                if let Some(guard) = &e.keep_alive {
                    if !keep_alive.iter().any(|g| Arc::ptr_eq(g, guard)) {
                        keep_alive.push(guard.clone());
                    }
                }
                e.item.clone()
            })
            .collect();

        Snapshot {
            items,
            _keep_alive: keep_alive,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every registered item.
    pub fn clear(&self) {
        self.inner.write().unwrap().entries.clear();
    }

    /// Drops every file-attributed item, keeping programmatic
    /// registrations.
    pub fn clear_files(&self) {
        self.inner
            .write()
            .unwrap()
            .entries
            .retain(|e| e.origin.is_none());
    }
}

/// A point-in-time copy of a registry's items.
///
/// Also pins the shared objects the items came from, so an in-flight
/// iteration stays valid even if the originating plug-in file is
/// reloaded or deleted mid-iteration.
pub struct Snapshot<T: ?Sized> {
    items: Vec<Arc<T>>,
    _keep_alive: Vec<Arc<dyn Any + Send + Sync>>,
}

impl<T: ?Sized> Deref for Snapshot<T> {
    type Target = [Arc<T>];

    fn deref(&self) -> &Self::Target {
        &self.items
    }
}

impl<'a, T: ?Sized> IntoIterator for &'a Snapshot<T> {
    type Item = &'a Arc<T>;
    type IntoIter = std::slice::Iter<'a, Arc<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
