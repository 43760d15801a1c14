//! In-memory backends for tests and local runs.
//!
//! [`MemoryBackend`] stands in for the relational store and
//! [`MemorySharedStore`] for the shared key-value/queue store. Each atomic
//! script takes the store's single mutex for its whole body, which gives the
//! same all-or-nothing behavior the engine requires from a real server-side
//! script.

#[cfg(feature = "run-backend")]
mod run_backend;

#[cfg(feature = "shared-store")]
mod keyspace;
#[cfg(feature = "shared-store")]
mod queue_scripts;
#[cfg(feature = "shared-store")]
mod shared_store;
#[cfg(feature = "shared-store")]
mod token_bucket_scripts;

#[cfg(feature = "run-backend")]
pub use run_backend::MemoryBackend;

#[cfg(feature = "shared-store")]
pub use shared_store::MemorySharedStore;
