// src/jar.rs
//! The cookie jar: durable knowledge store plus the in-memory dirty
//! queue with reservation semantics.

mod jar;
mod locks;
mod queue;
mod retry;
mod store;

pub use jar::CookieJar;
pub use jar::CookieJarHandle;
pub use jar::DirtyListener;
pub use queue::QueueLength;
pub use retry::RetryPolicy;

pub use store::CookieDocument;
pub use store::DocumentStore;
pub use store::DocumentStoreHandle;
pub use store::InMemoryDocumentStore;
pub use store::ProcessingState;
#[cfg(feature = "sqlite_store")]
pub use store::SqliteDocumentStore;
