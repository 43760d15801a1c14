use std::sync::{Arc, Mutex, MutexGuard};

use conveyor_backends_core::BackendResult;
use conveyor_shared_store::{DeficitScripts, KeyValueStore, LockStore};

use crate::keyspace::{Keyspace, LockEntry};

/// Shared key-value/queue store kept in process memory.
///
/// Clones share the same keyspace, so several engine instances built over one
/// store behave like separate processes talking to the same server.
#[derive(Clone, Default)]
pub struct MemorySharedStore {
    keyspace: Arc<Mutex<Keyspace>>,
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        self.keyspace.lock().expect("keyspace poisoned")
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemorySharedStore {
    async fn get(&self, key: &str) -> BackendResult<Option<String>> {
        Ok(self.keyspace().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> BackendResult<()> {
        self.keyspace().set(key, value);
        Ok(())
    }

    async fn del(&self, key: &str) -> BackendResult<bool> {
        Ok(self.keyspace().del(key))
    }

    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> BackendResult<f64> {
        self.keyspace().hincr_by_float(key, field, delta)
    }

    async fn hget_all(&self, key: &str) -> BackendResult<Vec<(String, String)>> {
        Ok(self.keyspace().hget_all(key))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> BackendResult<Vec<(String, f64)>> {
        Ok(self.keyspace().zrange_by_score(key, min, max, limit))
    }

    async fn zcard(&self, key: &str) -> BackendResult<usize> {
        Ok(self.keyspace().zcard(key))
    }

    async fn scard(&self, key: &str) -> BackendResult<usize> {
        Ok(self.keyspace().scard(key))
    }

    async fn llen(&self, key: &str) -> BackendResult<usize> {
        Ok(self.keyspace().llen(key))
    }
}

#[async_trait::async_trait]
impl LockStore for MemorySharedStore {
    async fn try_acquire_lock(
        &self,
        key: &str,
        owner: &str,
        expires_at_ms: i64,
        now_ms: i64,
    ) -> BackendResult<bool> {
        let mut keyspace = self.keyspace();
        if let Some(entry) = keyspace.locks.get(key)
            && entry.expires_at_ms > now_ms
        {
            return Ok(false);
        }
        keyspace.locks.insert(
            key.to_string(),
            LockEntry {
                owner: owner.to_string(),
                expires_at_ms,
            },
        );
        Ok(true)
    }

    async fn extend_lock(
        &self,
        key: &str,
        owner: &str,
        expires_at_ms: i64,
        now_ms: i64,
    ) -> BackendResult<bool> {
        let mut keyspace = self.keyspace();
        match keyspace.locks.get_mut(key) {
            Some(entry) if entry.owner == owner && entry.expires_at_ms > now_ms => {
                entry.expires_at_ms = expires_at_ms;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, key: &str, owner: &str) -> BackendResult<bool> {
        let mut keyspace = self.keyspace();
        let held = keyspace
            .locks
            .get(key)
            .is_some_and(|entry| entry.owner == owner);
        if held {
            keyspace.locks.remove(key);
        }
        Ok(held)
    }
}

#[async_trait::async_trait]
impl DeficitScripts for MemorySharedStore {
    async fn add_quantum(
        &self,
        key: &str,
        tenant_ids: &[String],
        quantum: f64,
        max_deficit: f64,
    ) -> BackendResult<Vec<f64>> {
        let mut keyspace = self.keyspace();
        let mut deficits = Vec::with_capacity(tenant_ids.len());
        for tenant_id in tenant_ids {
            let next = (keyspace.hget_f64(key, tenant_id)? + quantum).min(max_deficit);
            keyspace.hset(key, tenant_id, next.to_string());
            deficits.push(next);
        }
        Ok(deficits)
    }

    async fn decrement_deficits(
        &self,
        key: &str,
        processed: &[(String, f64)],
    ) -> BackendResult<Vec<f64>> {
        let mut keyspace = self.keyspace();
        let mut deficits = Vec::with_capacity(processed.len());
        for (tenant_id, count) in processed {
            let next = (keyspace.hget_f64(key, tenant_id)? - count).max(0.0);
            keyspace.hset(key, tenant_id, next.to_string());
            deficits.push(next);
        }
        Ok(deficits)
    }

    async fn reset_deficit(&self, key: &str, tenant_id: &str) -> BackendResult<()> {
        self.keyspace().hdel(key, tenant_id);
        Ok(())
    }

    async fn reset_deficits_except(&self, key: &str, active: &[String]) -> BackendResult<usize> {
        let mut keyspace = self.keyspace();
        let idle: Vec<String> = keyspace
            .hget_all(key)
            .into_iter()
            .map(|(tenant_id, _)| tenant_id)
            .filter(|tenant_id| !active.contains(tenant_id))
            .collect();
        for tenant_id in &idle {
            keyspace.hdel(key, tenant_id);
        }
        Ok(idle.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_release_is_owner_checked() {
        let store = MemorySharedStore::new();
        assert!(store.try_acquire_lock("lock:run:a", "owner-1", 1_000, 0).await.unwrap());
        assert!(!store.try_acquire_lock("lock:run:a", "owner-2", 1_000, 10).await.unwrap());

        assert!(!store.release_lock("lock:run:a", "owner-2").await.unwrap());
        assert!(store.release_lock("lock:run:a", "owner-1").await.unwrap());
        assert!(store.try_acquire_lock("lock:run:a", "owner-2", 1_000, 20).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_over() {
        let store = MemorySharedStore::new();
        assert!(store.try_acquire_lock("k", "old", 100, 0).await.unwrap());
        assert!(store.try_acquire_lock("k", "new", 300, 150).await.unwrap());
        assert!(!store.extend_lock("k", "old", 500, 160).await.unwrap());
        assert!(!store.release_lock("k", "old").await.unwrap());
        assert!(store.extend_lock("k", "new", 500, 160).await.unwrap());
    }

    #[tokio::test]
    async fn deficits_cap_and_floor() {
        let store = MemorySharedStore::new();
        let tenants = vec!["a".to_string(), "b".to_string()];
        for _ in 0..10 {
            store.add_quantum("d", &tenants, 10.0, 50.0).await.unwrap();
        }
        assert_eq!(
            store.add_quantum("d", &tenants, 10.0, 50.0).await.unwrap(),
            vec![50.0, 50.0]
        );

        let after = store
            .decrement_deficits("d", &[("a".to_string(), 80.0), ("b".to_string(), 1.0)])
            .await
            .unwrap();
        assert_eq!(after, vec![0.0, 49.0]);

        store.reset_deficit("d", "b").await.unwrap();
        assert_eq!(store.hget_all("d").await.unwrap(), vec![("a".to_string(), "0".to_string())]);
    }

    #[tokio::test]
    async fn idle_deficits_are_dropped_together() {
        let store = MemorySharedStore::new();
        let tenants = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        store.add_quantum("d", &tenants, 10.0, 50.0).await.unwrap();

        let dropped = store
            .reset_deficits_except("d", &["b".to_string()])
            .await
            .unwrap();
        assert_eq!(dropped, 2);
        assert_eq!(store.hget_all("d").await.unwrap(), vec![("b".to_string(), "10".to_string())]);
        assert_eq!(store.reset_deficits_except("d", &["b".to_string()]).await.unwrap(), 0);
    }
}
