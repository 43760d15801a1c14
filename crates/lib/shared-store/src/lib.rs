//! Shared key-value/queue store contract.
//!
//! The run queue, the run lock, the fair scheduler and the release-concurrency
//! token bucket all keep their state in one low-latency store. Every method on
//! the `*Scripts` traits is a single atomic server-side operation: an
//! implementation must apply the whole effect or none of it, and no other
//! operation may observe an intermediate state. Callers build every key with
//! the engine's key producer; the store never invents key names except where a
//! keyspace template is passed in explicitly.

mod scripts;

pub use conveyor_backends_core::{BackendError, BackendResult};

pub use self::scripts::*;

/// Plain data-structure primitives.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> BackendResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> BackendResult<()>;

    async fn del(&self, key: &str) -> BackendResult<bool>;

    /// Increment a hash field by a float and return the new value.
    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> BackendResult<f64>;

    async fn hget_all(&self, key: &str) -> BackendResult<Vec<(String, String)>>;

    /// Members with `min <= score <= max`, lowest score first.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> BackendResult<Vec<(String, f64)>>;

    async fn zcard(&self, key: &str) -> BackendResult<usize>;

    async fn scard(&self, key: &str) -> BackendResult<usize>;

    async fn llen(&self, key: &str) -> BackendResult<usize>;
}

/// Lease-based mutual exclusion keyed by string.
#[async_trait::async_trait]
pub trait LockStore: Send + Sync {
    /// Take the lock if it is free or its lease expired before `now_ms`.
    async fn try_acquire_lock(
        &self,
        key: &str,
        owner: &str,
        expires_at_ms: i64,
        now_ms: i64,
    ) -> BackendResult<bool>;

    /// Push the lease forward only while `owner` still holds it.
    async fn extend_lock(
        &self,
        key: &str,
        owner: &str,
        expires_at_ms: i64,
        now_ms: i64,
    ) -> BackendResult<bool>;

    /// Check-and-clear: delete the lock only when `owner` holds it.
    async fn release_lock(&self, key: &str, owner: &str) -> BackendResult<bool>;
}

/// Everything the engine needs from the shared store.
pub trait SharedStore:
    KeyValueStore + LockStore + RunQueueScripts + DeficitScripts + TokenBucketScripts
{
}

impl<T> SharedStore for T where
    T: KeyValueStore + LockStore + RunQueueScripts + DeficitScripts + TokenBucketScripts
{
}
