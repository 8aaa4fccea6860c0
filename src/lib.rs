#![deny(unsafe_code)]
// unsafe is allowed back in exactly one place: the shared-object
// plug-in loader, which is unsafe by nature.

//! # Cookie Monster
//!
//! Cookie Monster ingests streams of update events about external data
//! objects, aggregates per-object knowledge into **cookies**, and runs
//! a priority-ordered production-rule system against each object
//! whenever its knowledge changes. Rules either fire terminating
//! actions (notifications) or let **enrichment loaders** fetch further
//! knowledge, after which the object re-enters processing.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use cookie_monster::prelude::*;
//! use cookie_monster::registry::{LoaderRegistry, ReceiverRegistry, RuleRegistry};
//!
//! # fn main() -> anyhow::Result<()> {
//! // Knowledge store (in-memory here; SQLite in production).
//! let store = Arc::new(InMemoryDocumentStore::new());
//! let jar = CookieJar::open(store, RetryPolicy::default())?;
//!
//! // Live plug-in collections; register programmatically or attach a
//! // RegistryWatcher to hot-load shared objects from a directory.
//! let rules = RuleRegistry::new("rules");
//! let loaders = LoaderRegistry::new("loaders");
//! let receivers = ReceiverRegistry::new("receivers");
//!
//! let notifier = Arc::new(Notifier::new(receivers));
//! let manager = ProcessorManager::new(
//!     jar.clone(), rules, loaders, notifier, Duration::from_secs(5),
//! );
//! manager.start(4);
//!
//! // An external retriever feeds updates; workers do the rest.
//! jar.enrich("/seq/run-42", Enrichment::now("irods", Default::default()))?;
//! # Ok(()) }
//! ```
//!
//! ## Concepts
//! - [`Cookie`](cookie::Cookie) — all accumulated knowledge about one data object
//! - [`CookieJar`](jar::CookieJar) — knowledge store + dirty queue with
//!   at-most-one-in-flight reservations per object
//! - [`Rule`](rules::Rule), [`EnrichmentLoader`](rules::EnrichmentLoader),
//!   [`NotificationReceiver`](rules::NotificationReceiver) — the plug-in seams
//! - [`Registry`](registry::Registry) — live, priority-ordered plug-in sets,
//!   hot-reloaded from watched directories
//! - [`ProcessorManager`](processor::ProcessorManager) — the worker pool
//!
//! ## Modules
//! - [`cookie`] — the data model
//! - [`rules`] — plug-in traits, notifications, rule actions
//! - [`jar`] — the cookie jar and its document stores
//! - [`registry`] — registries, directory watching, shared-object loading
//! - [`processor`] — rule evaluation and the worker pool
//! - [`notifier`] — notification fan-out
//! - [`http`] — the JSON façade
//! - [`config`] — service configuration

pub mod config;
pub mod cookie;
mod errors;
pub mod http;
pub mod jar;
pub mod notifier;
pub mod processor;
pub mod registry;
pub mod rules;

pub use errors::{JarError, QueueError, StoreError};

pub mod prelude {
    pub use crate::cookie::{Cookie, Enrichment, EnrichmentCollection};
    pub use crate::jar::{CookieJar, CookieJarHandle, InMemoryDocumentStore, RetryPolicy};
    pub use crate::notifier::Notifier;
    pub use crate::processor::ProcessorManager;
    pub use crate::rules::{
        EnrichmentLoader, Notification, NotificationReceiver, Rule, RuleAction,
    };
    pub use crate::{JarError, QueueError, StoreError};
}
