// src/http.rs
//! JSON HTTP façade over the jar and the worker pool.

mod routes;
mod server;

pub use routes::router;
pub use routes::AppState;
pub use server::serve;
