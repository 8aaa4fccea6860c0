// src/registry.rs
//! Hot-reloading, priority-ordered plug-in registries.

mod registry;
#[allow(unsafe_code)]
mod shared_object;
mod watcher;

pub use registry::LoaderRegistry;
pub use registry::ReceiverRegistry;
pub use registry::Registry;
pub use registry::RegistryItem;
pub use registry::RuleRegistry;
pub use registry::Snapshot;

pub use watcher::FileMatcher;
pub use watcher::LoadedPlugin;
pub use watcher::PluginLoader;
pub use watcher::RegistryWatcher;

pub use shared_object::SharedObjectLoader;
pub use shared_object::REGISTER_LOADERS_SYMBOL;
pub use shared_object::REGISTER_RECEIVERS_SYMBOL;
pub use shared_object::REGISTER_RULES_SYMBOL;
