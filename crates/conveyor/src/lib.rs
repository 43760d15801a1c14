//! Multi-tenant run execution engine.
//!
//! Runs move through an append-only chain of execution snapshots, each
//! transition taken under a per-run lock. Queue state, concurrency counters,
//! fairness deficits and release-concurrency token buckets live in a shared
//! store behind atomic scripts, so any number of engine instances can work
//! against the same store.

pub mod attempts;
pub mod checkpoint;
pub mod config;
pub mod dequeue;
pub mod engine;
pub mod enqueue;
pub mod error;
pub mod events;
pub mod fair_queue;
pub mod release_concurrency;
pub mod resources;
pub mod run_lock;
pub mod run_queue;
pub mod snapshots;
pub mod waitpoints;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use engine::{RunEngine, TriggerRequest};
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventBus};
pub use resources::SystemResources;

pub use conveyor_run_core as core;

/// Wall-clock milliseconds, the time base of every score and lease in the shared store.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
