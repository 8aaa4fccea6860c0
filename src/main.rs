//! Service bootstrap: configuration, logging, wiring, shutdown.

use std::sync::Arc;

use anyhow::Result;
use log::{info, warn};

use cookie_monster::config::MonsterConfig;
use cookie_monster::http::{self, AppState};
use cookie_monster::jar::{CookieJar, DocumentStoreHandle};
use cookie_monster::notifier::Notifier;
use cookie_monster::processor::ProcessorManager;
use cookie_monster::registry::{
    FileMatcher, LoaderRegistry, ReceiverRegistry, RegistryItem, RegistryWatcher, RuleRegistry,
    SharedObjectLoader,
};

const DEFAULT_CONFIG_FILE: &str = "cookie-monster.toml";

fn main() -> Result<()> {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => MonsterConfig::load(path)?,
        None if std::path::Path::new(DEFAULT_CONFIG_FILE).exists() => {
            MonsterConfig::load(DEFAULT_CONFIG_FILE)?
        }
        None => MonsterConfig::default(),
    };

    let store = open_store(&config)?;
    let jar = CookieJar::open(store, config.retry_policy())?;

    let rules = RuleRegistry::new("rules");
    let loaders = LoaderRegistry::new("loaders");
    let receivers = ReceiverRegistry::new("receivers");

    let mut watchers = Watchers {
        rules: start_watcher(
            &config.plugins.rules_dir,
            &rules,
            SharedObjectLoader::rules(),
            "rule",
        )?,
        loaders: start_watcher(
            &config.plugins.loaders_dir,
            &loaders,
            SharedObjectLoader::loaders(),
            "loader",
        )?,
        receivers: start_watcher(
            &config.plugins.receivers_dir,
            &receivers,
            SharedObjectLoader::receivers(),
            "receiver",
        )?,
    };

    let notifier = Arc::new(Notifier::new(receivers));
    let manager = ProcessorManager::new(
        jar.clone(),
        rules,
        loaders,
        notifier,
        config.poll_timeout(),
    );
    manager.start(config.processing.workers);

    let state = AppState {
        jar: jar.clone(),
        manager: manager.clone(),
    };

    // The core is thread-based; the façade gets its own small runtime
    // on the main thread, and its exit drives shutdown.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    runtime.block_on(http::serve(config.http.bind, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    }))?;

    manager.stop();
    watchers.stop();
    info!("bye");
    Ok(())
}

fn open_store(config: &MonsterConfig) -> Result<DocumentStoreHandle> {
    #[cfg(feature = "sqlite_store")]
    {
        use cookie_monster::jar::SqliteDocumentStore;
        info!("opening cookie store {}", config.database.path.display());
        Ok(SqliteDocumentStore::open(config.database.path.clone())?)
    }
    #[cfg(not(feature = "sqlite_store"))]
    {
        use cookie_monster::jar::InMemoryDocumentStore;
        let _ = config;
        warn!("built without sqlite_store; cookies will not survive a restart");
        Ok(Arc::new(InMemoryDocumentStore::new()))
    }
}

struct Watchers {
    rules: Option<RegistryWatcher<dyn cookie_monster::rules::Rule>>,
    loaders: Option<RegistryWatcher<dyn cookie_monster::rules::EnrichmentLoader>>,
    receivers: Option<RegistryWatcher<dyn cookie_monster::rules::NotificationReceiver>>,
}

impl Watchers {
    fn stop(&mut self) {
        if let Some(watcher) = self.rules.as_mut() {
            watcher.stop();
        }
        if let Some(watcher) = self.loaders.as_mut() {
            watcher.stop();
        }
        if let Some(watcher) = self.receivers.as_mut() {
            watcher.stop();
        }
    }
}

fn start_watcher<T>(
    dir: &Option<std::path::PathBuf>,
    registry: &Arc<cookie_monster::registry::Registry<T>>,
    loader: SharedObjectLoader<T>,
    kind: &str,
) -> Result<Option<RegistryWatcher<T>>>
where
    T: RegistryItem + ?Sized + 'static,
    SharedObjectLoader<T>: cookie_monster::registry::PluginLoader<T>,
{
    let Some(dir) = dir else {
        warn!("no {kind} plug-in directory configured");
        return Ok(None);
    };

    let mut watcher = RegistryWatcher::new(
        registry.clone(),
        Arc::new(loader),
        dir.clone(),
        FileMatcher::kind(kind),
    );
    watcher.start()?;
    info!("watching {} for {kind} plug-ins", dir.display());
    Ok(Some(watcher))
}
