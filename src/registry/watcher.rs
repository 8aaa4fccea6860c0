//! Directory watching for plug-in registries.
//!
//! A [`RegistryWatcher`] binds a registry to a directory tree: on
//! `start` it scans the tree and loads every file matching the
//! registry's filename predicate, then subscribes to create / modify /
//! remove events so plug-ins can be hot-swapped while the system runs.
//!
//! How a file becomes items is delegated to a [`PluginLoader`]; the
//! production loader executes shared objects (see
//! [`SharedObjectLoader`](crate::registry::SharedObjectLoader)), tests
//! substitute cheap text-based loaders. File-level failures are
//! isolated: a file that fails to load is logged and skipped, its
//! previously attributed items are dropped, and a later modification
//! re-attempts the load.
//!
//! The notification back-end is selected by `notify` based on the
//! platform; some back-ends coalesce or miss events, so a watch error
//! triggers a full rescan and a missing previously-loaded file is
//! treated as deleted.

use std::any::Any;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::registry::{Registry, RegistryItem};

/// Filename predicate for one plug-in kind.
///
/// Matches files carrying `.{kind}.` in their name — for example
/// `FileMatcher::kind("rule")` accepts `archival.rule.so`. Hidden files
/// are never matched.
#[derive(Debug, Clone)]
pub struct FileMatcher {
    marker: String,
}

impl FileMatcher {
    pub fn kind(kind: &str) -> Self {
        Self {
            marker: format!(".{kind}."),
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| !name.starts_with('.') && name.contains(&self.marker))
    }
}

/// The outcome of loading one plug-in file.
pub struct LoadedPlugin<T: ?Sized> {
    /// Items the file registered, in registration order.
    pub items: Vec<Arc<T>>,

    /// Guard that must outlive the items (e.g. the loaded `Library`).
    pub keep_alive: Option<Arc<dyn Any + Send + Sync>>,
}

/// Turns one plug-in file into registry items.
pub trait PluginLoader<T: RegistryItem + ?Sized>: Send + Sync {
    fn load(&self, path: &Path) -> Result<LoadedPlugin<T>>;
}

/// Watches a directory tree and keeps a [`Registry`] in sync with the
/// plug-in files beneath it.
pub struct RegistryWatcher<T: RegistryItem + ?Sized + 'static> {
    registry: Arc<Registry<T>>,
    loader: Arc<dyn PluginLoader<T>>,
    root: PathBuf,
    matcher: FileMatcher,
    watcher: Option<RecommendedWatcher>,
    thread: Option<JoinHandle<()>>,
}

impl<T: RegistryItem + ?Sized + 'static> RegistryWatcher<T> {
    pub fn new(
        registry: Arc<Registry<T>>,
        loader: Arc<dyn PluginLoader<T>>,
        root: impl Into<PathBuf>,
        matcher: FileMatcher,
    ) -> Self {
        Self {
            registry,
            loader,
            root: root.into(),
            matcher,
            watcher: None,
            thread: None,
        }
    }

    /// Scans the tree, loads matching files, and starts watching.
    pub fn start(&mut self) -> Result<()> {
        let (tx, rx) = channel();

        let mut watcher = recommended_watcher(tx)?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .with_context(|| format!("watching {}", self.root.display()))?;

        rescan(&self.registry, &*self.loader, &self.root, &self.matcher);

        let thread = {
            let registry = self.registry.clone();
            let loader = self.loader.clone();
            let root = self.root.clone();
            let matcher = self.matcher.clone();
            thread::spawn(move || watch_loop(&rx, &registry, &*loader, &root, &matcher))
        };

        self.watcher = Some(watcher);
        self.thread = Some(thread);
        Ok(())
    }

    /// Re-walks the tree: loads new/changed matches, unregisters files
    /// that have gone missing.
    pub fn rescan(&self) {
        rescan(&self.registry, &*self.loader, &self.root, &self.matcher);
    }

    /// Releases the filesystem watcher, joins the watch thread, and
    /// unregisters everything this watcher loaded.
    pub fn stop(&mut self) {
        // Dropping the watcher closes the event channel, which ends the
        // watch loop.
        let was_watching = self.watcher.take().is_some();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if was_watching {
            self.registry.clear_files();
        }
    }
}

impl<T: RegistryItem + ?Sized + 'static> Drop for RegistryWatcher<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_loop<T: RegistryItem + ?Sized>(
    rx: &Receiver<notify::Result<Event>>,
    registry: &Registry<T>,
    loader: &dyn PluginLoader<T>,
    root: &Path,
    matcher: &FileMatcher,
) {
    for event in rx {
        match event {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    continue;
                }
                for path in &event.paths {
                    if !matcher.matches(path) {
                        continue;
                    }
                    if matches!(event.kind, EventKind::Remove(_)) || !path.exists() {
                        let removed = registry.remove_file(path);
                        if removed > 0 {
                            info!("unloaded {removed} item(s) from deleted {}", path.display());
                        }
                    } else {
                        load_file(registry, loader, path);
                    }
                }
            }
            Err(e) => {
                // The back-end may have dropped events; resynchronize
                // from the tree itself.
                warn!("watch error on {}: {e}", root.display());
                rescan(registry, loader, root, matcher);
            }
        }
    }
    debug!("stopped watching {}", root.display());
}

fn load_file<T: RegistryItem + ?Sized>(
    registry: &Registry<T>,
    loader: &dyn PluginLoader<T>,
    path: &Path,
) {
    match loader.load(path) {
        Ok(plugin) => {
            let count = plugin.items.len();
            registry.install_file(path, plugin);
            info!("loaded {count} item(s) from {}", path.display());
        }
        Err(e) => {
            // The file's previous items are dropped; a later
            // modification re-attempts the load.
            let removed = registry.remove_file(path);
            error!(
                "failed to load plug-in {} ({removed} prior item(s) unregistered): {e:#}",
                path.display()
            );
        }
    }
}

fn rescan<T: RegistryItem + ?Sized>(
    registry: &Registry<T>,
    loader: &dyn PluginLoader<T>,
    root: &Path,
    matcher: &FileMatcher,
) {
    let mut found = HashSet::new();
    walk(root, matcher, &mut |path| {
        found.insert(path.to_path_buf());
        load_file(registry, loader, path);
    });

    // A previously loaded file that no longer exists counts as deleted,
    // even if the watcher never delivered the event.
    for stale in registry.files() {
        if stale.starts_with(root) && !found.contains(&stale) {
            let removed = registry.remove_file(&stale);
            info!("unloaded {removed} item(s) from missing {}", stale.display());
        }
    }
}

fn walk(dir: &Path, matcher: &FileMatcher, visit: &mut impl FnMut(&Path)) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot read plug-in directory {}: {e}", dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, matcher, visit);
        } else if matcher.matches(&path) {
            visit(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::Cookie;
    use crate::registry::RuleRegistry;
    use crate::rules::{Rule, RuleAction};
    use std::time::{Duration, Instant};

    struct StubRule {
        id: String,
        priority: i32,
    }

    impl Rule for StubRule {
        fn id(&self) -> &str {
            &self.id
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn matches(&self, _cookie: &Cookie) -> anyhow::Result<bool> {
            Ok(false)
        }

        fn apply(&self, _cookie: &Cookie) -> anyhow::Result<RuleAction> {
            Ok(RuleAction::default())
        }
    }

    /// Parses `id priority` lines; a line of `!` fails the whole file.
    struct TextLoader;

    impl PluginLoader<dyn Rule> for TextLoader {
        fn load(&self, path: &Path) -> Result<LoadedPlugin<dyn Rule>> {
            let text = std::fs::read_to_string(path)?;
            let mut items: Vec<Arc<dyn Rule>> = Vec::new();
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                if line.trim() == "!" {
                    anyhow::bail!("poison line");
                }
                let (id, priority) = line
                    .split_once(' ')
                    .context("expected `id priority` lines")?;
                items.push(Arc::new(StubRule {
                    id: id.to_string(),
                    priority: priority.trim().parse()?,
                }));
            }
            Ok(LoadedPlugin {
                items,
                keep_alive: None,
            })
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn snapshot_ids(registry: &RuleRegistry) -> Vec<(String, i32)> {
        registry
            .snapshot()
            .iter()
            .map(|r| (Rule::id(r.as_ref()).to_string(), Rule::priority(r.as_ref())))
            .collect()
    }

    #[test]
    fn matcher_accepts_kind_infix_only() {
        let m = FileMatcher::kind("rule");
        assert!(m.matches(Path::new("/d/archival.rule.so")));
        assert!(m.matches(Path::new("a.rule.txt")));
        assert!(!m.matches(Path::new("/d/archival.loader.so")));
        assert!(!m.matches(Path::new("/d/.hidden.rule.so")));
        assert!(!m.matches(Path::new("/d/rule.so")));
    }

    #[test]
    fn initial_scan_loads_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rule.txt"), "r1 100\nr2 50\n").unwrap();
        std::fs::write(dir.path().join("ignored.txt"), "junk").unwrap();

        let registry = RuleRegistry::new("rules");
        let mut watcher = RegistryWatcher::new(
            registry.clone(),
            Arc::new(TextLoader),
            dir.path(),
            FileMatcher::kind("rule"),
        );
        watcher.start().unwrap();

        assert_eq!(
            snapshot_ids(&registry),
            vec![("r1".to_string(), 100), ("r2".to_string(), 50)]
        );
        watcher.stop();
    }

    #[test]
    fn a_bad_file_does_not_affect_others() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.rule.txt"), "r1 100\n").unwrap();
        std::fs::write(dir.path().join("bad.rule.txt"), "!\n").unwrap();

        let registry = RuleRegistry::new("rules");
        let mut watcher = RegistryWatcher::new(
            registry.clone(),
            Arc::new(TextLoader),
            dir.path(),
            FileMatcher::kind("rule"),
        );
        watcher.start().unwrap();

        assert_eq!(snapshot_ids(&registry), vec![("r1".to_string(), 100)]);
        watcher.stop();
    }

    #[test]
    fn created_files_are_picked_up() {
        let dir = tempfile::tempdir().unwrap();

        let registry = RuleRegistry::new("rules");
        let mut watcher = RegistryWatcher::new(
            registry.clone(),
            Arc::new(TextLoader),
            dir.path(),
            FileMatcher::kind("rule"),
        );
        watcher.start().unwrap();
        assert!(registry.is_empty());

        std::fs::write(dir.path().join("late.rule.txt"), "r9 10\n").unwrap();
        assert!(wait_until(Duration::from_secs(5), || registry.len() == 1));

        watcher.stop();
    }

    #[test]
    fn deleted_files_are_unloaded() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.rule.txt");
        std::fs::write(&file, "r1 100\n").unwrap();

        let registry = RuleRegistry::new("rules");
        let mut watcher = RegistryWatcher::new(
            registry.clone(),
            Arc::new(TextLoader),
            dir.path(),
            FileMatcher::kind("rule"),
        );
        watcher.start().unwrap();
        assert_eq!(registry.len(), 1);

        std::fs::remove_file(&file).unwrap();
        assert!(wait_until(Duration::from_secs(5), || registry.is_empty()));

        watcher.stop();
    }

    #[test]
    fn rescan_treats_missing_files_as_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.rule.txt");
        std::fs::write(&file, "r1 100\n").unwrap();

        let registry = RuleRegistry::new("rules");
        let watcher = RegistryWatcher::new(
            registry.clone(),
            Arc::new(TextLoader),
            dir.path(),
            FileMatcher::kind("rule"),
        );

        // Load without the live watcher, then lose the file behind the
        // registry's back.
        watcher.rescan();
        assert_eq!(registry.len(), 1);

        std::fs::remove_file(&file).unwrap();
        watcher.rescan();
        assert!(registry.is_empty());
    }
}
