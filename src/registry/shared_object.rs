//! Shared-object plug-in loading.
//!
//! Plug-ins are compiled as dynamic libraries (`cdylib`) and expose a
//! `register` entry point per item kind. Loading a file opens the
//! library and calls the entry point with a registration sink; every
//! item handed to the sink is attributed to that file by the registry,
//! which also keeps the [`Library`] alive for as long as any of its
//! items (or a snapshot containing them) is reachable.
//!
//! A rules plug-in looks like:
//!
//! ```ignore
//! use std::sync::Arc;
//! use cookie_monster::rules::Rule;
//!
//! #[no_mangle]
//! pub extern "Rust" fn cookie_monster_register_rules(
//!     register: &mut dyn FnMut(Arc<dyn Rule>),
//! ) {
//!     register(Arc::new(ArchivalRule::default()));
//! }
//! ```
//!
//! The entry point uses the Rust ABI, so plug-ins must be built with
//! the same compiler as the host. Missing symbols, unresolved imports
//! and panics during registration fail that file only; the watcher
//! logs the error and retries on the next modification.

use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use libloading::{Library, Symbol};

use crate::registry::watcher::{LoadedPlugin, PluginLoader};
use crate::registry::RegistryItem;
use crate::rules::{EnrichmentLoader, NotificationReceiver, Rule};

/// Entry point looked up in rule plug-ins.
pub const REGISTER_RULES_SYMBOL: &[u8] = b"cookie_monster_register_rules";

/// Entry point looked up in enrichment-loader plug-ins.
pub const REGISTER_LOADERS_SYMBOL: &[u8] = b"cookie_monster_register_loaders";

/// Entry point looked up in notification-receiver plug-ins.
pub const REGISTER_RECEIVERS_SYMBOL: &[u8] = b"cookie_monster_register_receivers";

type RegisterFn<T> = unsafe extern "Rust" fn(&mut dyn FnMut(Arc<T>));

/// [`PluginLoader`] executing shared objects.
pub struct SharedObjectLoader<T: ?Sized> {
    symbol: &'static [u8],
    _kind: PhantomData<fn() -> Arc<T>>,
}

impl SharedObjectLoader<dyn Rule> {
    pub fn rules() -> Self {
        Self {
            symbol: REGISTER_RULES_SYMBOL,
            _kind: PhantomData,
        }
    }
}

impl SharedObjectLoader<dyn EnrichmentLoader> {
    pub fn loaders() -> Self {
        Self {
            symbol: REGISTER_LOADERS_SYMBOL,
            _kind: PhantomData,
        }
    }
}

impl SharedObjectLoader<dyn NotificationReceiver> {
    pub fn receivers() -> Self {
        Self {
            symbol: REGISTER_RECEIVERS_SYMBOL,
            _kind: PhantomData,
        }
    }
}

impl<T: RegistryItem + ?Sized + 'static> PluginLoader<T> for SharedObjectLoader<T> {
    fn load(&self, path: &Path) -> Result<LoadedPlugin<T>> {
        // SAFETY: loading and calling into a shared object executes
        // arbitrary initialization code; that is the point of the
        // plug-in system. The library handle is kept alive alongside
        // every item it registered, so no registered item can outlive
        // its code.
        let library = unsafe { Library::new(path) }
            .with_context(|| format!("opening shared object {}", path.display()))?;
        let library = Arc::new(library);

        let symbol_name = String::from_utf8_lossy(self.symbol).into_owned();
        let mut items: Vec<Arc<T>> = Vec::new();
        {
            let register: Symbol<'_, RegisterFn<T>> = unsafe { library.get(self.symbol) }
                .with_context(|| format!("resolving `{symbol_name}` in {}", path.display()))?;

            let mut sink = |item: Arc<T>| items.push(item);
            catch_unwind(AssertUnwindSafe(|| unsafe { register(&mut sink) }))
                .map_err(|_| anyhow::anyhow!("`{symbol_name}` panicked in {}", path.display()))?;
        }

        Ok(LoadedPlugin {
            items,
            keep_alive: Some(library),
        })
    }
}
