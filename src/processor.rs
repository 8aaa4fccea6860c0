// src/processor.rs
//! Rule evaluation and the worker pool draining the dirty queue.

mod manager;
mod processor;

pub use manager::ProcessorManager;
pub use manager::WorkerDump;
pub use manager::WorkerState;
pub use processor::process;
pub use processor::Outcome;
