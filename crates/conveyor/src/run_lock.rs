//! Per-run lock with an owner-token lease.
//!
//! Acquisition retries until `timeout` and then fails instead of queueing.
//! While the critical section runs a heartbeat task keeps pushing the lease
//! forward; release deletes the lock only if this owner still holds it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use conveyor_run_core::RunId;
use conveyor_shared_store::SharedStore;

use crate::config::RunLockConfig;
use crate::error::{EngineError, EngineResult};
use crate::now_ms;
use crate::run_queue::RunQueueKeyProducer;

/// Proof that the holder is inside [`RunLocker::lock`] for `run_id`.
#[derive(Debug)]
pub struct RunLockGuard {
    run_id: RunId,
    owner: String,
}

impl RunLockGuard {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub(crate) fn ensure_holds(&self, run_id: RunId) -> EngineResult<()> {
        if self.run_id != run_id {
            return Err(EngineError::integrity(format!(
                "lock held for run {} used for run {run_id}",
                self.run_id
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct RunLocker {
    store: Arc<dyn SharedStore>,
    keys: RunQueueKeyProducer,
    config: RunLockConfig,
}

impl RunLocker {
    pub fn new(store: Arc<dyn SharedStore>, keys: RunQueueKeyProducer, config: RunLockConfig) -> Self {
        Self {
            store,
            keys,
            config,
        }
    }

    /// Run `f` while holding the lock for `run_id`.
    pub async fn lock<F, Fut, T>(&self, run_id: RunId, f: F) -> EngineResult<T>
    where
        F: FnOnce(RunLockGuard) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let key = self.keys.run_lock_key(run_id);
        let owner = Uuid::new_v4().to_string();
        self.acquire(run_id, &key, &owner).await?;
        debug!(%run_id, %owner, "run lock acquired");

        let stop = CancellationToken::new();
        let heartbeat = spawn_lease_heartbeat(
            self.store.clone(),
            key.clone(),
            owner.clone(),
            self.config.lease_duration,
            stop.clone().cancelled_owned(),
        );

        // Dropping this future mid-section cancels the heartbeat and lets the lease lapse.
        let heartbeat_guard = stop.drop_guard();

        let result = f(RunLockGuard {
            run_id,
            owner: owner.clone(),
        })
        .await;

        drop(heartbeat_guard);
        let _ = heartbeat.await;
        match self.store.release_lock(&key, &owner).await {
            Ok(true) => debug!(%run_id, "run lock released"),
            Ok(false) => warn!(%run_id, "run lock lease expired before release"),
            Err(err) => warn!(%run_id, error = %err, "failed to release run lock"),
        }
        result
    }

    async fn acquire(&self, run_id: RunId, key: &str, owner: &str) -> EngineResult<()> {
        let started = Instant::now();
        let lease_ms = self.config.lease_duration.as_millis() as i64;
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        loop {
            let now = now_ms();
            if self
                .store
                .try_acquire_lock(key, owner, now + lease_ms, now)
                .await?
            {
                return Ok(());
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.timeout {
                warn!(%run_id, timeout_ms = self.config.timeout.as_millis() as u64, "run lock timeout");
                return Err(EngineError::LockTimeout {
                    run_id,
                    timeout_ms: self.config.timeout.as_millis() as u64,
                });
            }

            let jitter = if jitter_ms > 0 {
                rand::thread_rng().gen_range(0..=jitter_ms)
            } else {
                0
            };
            let delay = (self.config.retry_delay + Duration::from_millis(jitter))
                .min(self.config.timeout - elapsed);
            tokio::time::sleep(delay).await;
        }
    }
}

fn spawn_lease_heartbeat(
    store: Arc<dyn SharedStore>,
    key: String,
    owner: String,
    lease_duration: Duration,
    stop: tokio_util::sync::WaitForCancellationFutureOwned,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = lease_duration / 2;
        let lease_ms = lease_duration.as_millis() as i64;
        let mut stop = std::pin::pin!(stop);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = tokio::time::sleep(interval) => {}
            };
            let now = now_ms();
            match store.extend_lock(&key, &owner, now + lease_ms, now).await {
                Ok(true) => debug!(%key, "run lock lease extended"),
                Ok(false) => {
                    warn!(%key, "run lock lease lost");
                    break;
                }
                Err(err) => warn!(%key, error = %err, "failed to extend run lock lease"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use conveyor_backend_memory::MemorySharedStore;
    use conveyor_shared_store::LockStore;

    use super::*;

    fn locker(store: &MemorySharedStore, timeout: Duration, lease: Duration) -> RunLocker {
        RunLocker::new(
            Arc::new(store.clone()),
            RunQueueKeyProducer::default(),
            RunLockConfig {
                timeout,
                lease_duration: lease,
                retry_delay: Duration::from_millis(10),
                retry_jitter: Duration::from_millis(5),
            },
        )
    }

    #[tokio::test]
    async fn second_caller_times_out() {
        let store = MemorySharedStore::new();
        let locker = locker(&store, Duration::from_millis(100), Duration::from_secs(10));
        let run_id = RunId::new();
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();

        let holder = {
            let locker = locker.clone();
            tokio::spawn(async move {
                locker
                    .lock(run_id, |_guard| async move {
                        let _ = entered_tx.send(());
                        tokio::time::sleep(Duration::from_millis(400)).await;
                        Ok(())
                    })
                    .await
            })
        };
        entered_rx.await.expect("holder entered");

        let started = std::time::Instant::now();
        let err = locker
            .lock(run_id, |_guard| async { Ok(()) })
            .await
            .expect_err("second caller must time out");
        assert!(matches!(err, EngineError::LockTimeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(350));

        holder.await.expect("join").expect("holder result");
    }

    #[tokio::test]
    async fn callers_are_serialized() {
        let store = MemorySharedStore::new();
        let locker = locker(&store, Duration::from_secs(2), Duration::from_secs(10));
        let run_id = RunId::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let locker = locker.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                tokio::spawn(async move {
                    locker
                        .lock(run_id, |_guard| async move {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("lock");
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abandoned_holder_lets_the_lease_lapse() {
        let store = MemorySharedStore::new();
        let locker = locker(&store, Duration::from_millis(300), Duration::from_millis(100));
        let run_id = RunId::new();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            locker.lock(run_id, |_guard| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }),
        )
        .await;
        assert!(abandoned.is_err(), "holder should be cut off by the timeout");

        tokio::time::sleep(Duration::from_millis(400)).await;
        let key = RunQueueKeyProducer::default().run_lock_key(run_id);
        let now = now_ms();
        assert!(
            store.try_acquire_lock(&key, "next", now + 100, now).await.unwrap(),
            "lease must expire once nobody extends it"
        );
        store.release_lock(&key, "next").await.unwrap();

        locker
            .lock(run_id, |_guard| async { Ok(()) })
            .await
            .expect("lock after abandoned holder");
    }

    #[tokio::test]
    async fn lease_is_extended_while_held() {
        let store = MemorySharedStore::new();
        let locker = locker(&store, Duration::from_millis(50), Duration::from_millis(100));
        let run_id = RunId::new();
        let key = RunQueueKeyProducer::default().run_lock_key(run_id);

        locker
            .lock(run_id, |_guard| {
                let store = store.clone();
                let key = key.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    // Past the original lease; still held thanks to the heartbeat.
                    let now = now_ms();
                    let taken = store
                        .try_acquire_lock(&key, "intruder", now + 100, now)
                        .await
                        .expect("try acquire");
                    assert!(!taken);
                    Ok(())
                }
            })
            .await
            .expect("lock");

        let now = now_ms();
        assert!(store.try_acquire_lock(&key, "next", now + 100, now).await.unwrap());
    }
}
