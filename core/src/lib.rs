//! # Emberfall Core
//!
//! Engine-agnostic building blocks for the Emberfall renderer: an owned
//! task queue and a capped pool of worker threads.
//!
//! The GPU-facing subsystems live in `emberfall-graphics`; this crate has no
//! GPU types and can be used from any thread.

pub mod task;
pub mod worker;

pub use task::{Task, TaskKind, TaskQueue};
pub use worker::WorkerPool;

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the core subsystem.
pub fn init() {
    log::info!("Emberfall Core v{} initialized", VERSION);
}
