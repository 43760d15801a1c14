//! Deficit round robin over tenants.
//!
//! Each round every tenant with a ready queue in the scan earns `quantum`
//! (capped at `max_deficit`), tenants at their concurrency ceiling sit the round
//! out, and the rest are offered in order of how much service they are owed.
//! Processing spends deficit, never below zero. Deficits live in one shared
//! hash and every mutation is a single atomic script, so several dispatchers
//! can share them.

mod dispatch;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use conveyor_run_core::TenantDescriptor;
use conveyor_shared_store::SharedStore;

pub use self::dispatch::{DispatchReport, FairDispatchTask};

use crate::config::FairQueueConfig;
use crate::error::EngineResult;
use crate::run_queue::{MasterQueueEntry, RunQueue, RunQueueKeyProducer};

/// Whether a tenant may receive more work right now.
#[async_trait::async_trait]
pub trait TenantCapacity: Send + Sync {
    async fn is_at_capacity(&self, tenant: &TenantDescriptor) -> EngineResult<bool>;
}

/// Hard cap: a tenant is full once its environment's current concurrency
/// reaches the environment limit.
#[derive(Clone)]
pub struct EnvironmentCapacity {
    run_queue: RunQueue,
}

impl EnvironmentCapacity {
    pub fn new(run_queue: RunQueue) -> Self {
        Self { run_queue }
    }
}

#[async_trait::async_trait]
impl TenantCapacity for EnvironmentCapacity {
    async fn is_at_capacity(&self, tenant: &TenantDescriptor) -> EngineResult<bool> {
        let current = self
            .run_queue
            .current_concurrency_of_environment(tenant)
            .await?;
        let limit = self.run_queue.env_concurrency_limit(tenant).await?;
        Ok(current >= limit as usize)
    }
}

/// A selected tenant and its ready queues, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantQueues {
    pub tenant: TenantDescriptor,
    pub deficit: f64,
    pub queues: Vec<MasterQueueEntry>,
}

#[derive(Clone)]
pub struct DrrScheduler {
    store: Arc<dyn SharedStore>,
    deficit_key: String,
    config: FairQueueConfig,
    capacity: Arc<dyn TenantCapacity>,
}

impl DrrScheduler {
    pub fn new(
        store: Arc<dyn SharedStore>,
        keys: &RunQueueKeyProducer,
        config: FairQueueConfig,
        capacity: Arc<dyn TenantCapacity>,
    ) -> Self {
        Self {
            store,
            deficit_key: keys.deficit_key().to_string(),
            config,
            capacity,
        }
    }

    pub fn config(&self) -> &FairQueueConfig {
        &self.config
    }

    /// One scheduling round over a master queue scan. The caller dequeues and
    /// then reports what it processed.
    pub async fn select_queues(
        &self,
        entries: &[MasterQueueEntry],
    ) -> EngineResult<Vec<TenantQueues>> {
        let mut by_tenant: BTreeMap<String, (TenantDescriptor, Vec<MasterQueueEntry>)> =
            BTreeMap::new();
        for entry in entries {
            let tenant = entry.descriptor.tenant();
            by_tenant
                .entry(tenant.tenant_id().to_string())
                .or_insert_with(|| (tenant, Vec::new()))
                .1
                .push(entry.clone());
        }
        if by_tenant.is_empty() {
            return Ok(Vec::new());
        }

        let tenant_ids: Vec<String> = by_tenant.keys().cloned().collect();
        let deficits = self
            .store
            .add_quantum(
                &self.deficit_key,
                &tenant_ids,
                self.config.quantum,
                self.config.max_deficit,
            )
            .await?;

        let mut selected = Vec::new();
        for ((tenant_id, (tenant, queues)), deficit) in by_tenant.into_iter().zip(deficits) {
            if self.capacity.is_at_capacity(&tenant).await? {
                debug!(%tenant_id, deficit, "tenant at capacity, skipping");
                continue;
            }
            if deficit < 1.0 {
                continue;
            }
            selected.push(TenantQueues {
                tenant,
                deficit,
                queues,
            });
        }

        selected.sort_by(|a, b| {
            b.deficit
                .total_cmp(&a.deficit)
                .then_with(|| a.tenant.tenant_id().cmp(b.tenant.tenant_id()))
        });
        debug!(
            scanned = tenant_ids.len(),
            selected = selected.len(),
            "drr round selected tenants"
        );
        Ok(selected)
    }

    /// Spend deficit for processed messages. Returns the new deficit.
    pub async fn record_processed(&self, tenant_id: &str, count: u32) -> EngineResult<f64> {
        let deficits = self
            .record_processed_batch(&[(tenant_id.to_string(), count)])
            .await?;
        Ok(deficits.first().copied().unwrap_or(0.0))
    }

    pub async fn record_processed_batch(&self, processed: &[(String, u32)]) -> EngineResult<Vec<f64>> {
        if processed.is_empty() {
            return Ok(Vec::new());
        }
        let processed: Vec<(String, f64)> = processed
            .iter()
            .map(|(tenant_id, count)| (tenant_id.clone(), f64::from(*count)))
            .collect();
        Ok(self
            .store
            .decrement_deficits(&self.deficit_key, &processed)
            .await?)
    }

    pub async fn reset_deficit(&self, tenant_id: &str) -> EngineResult<()> {
        Ok(self.store.reset_deficit(&self.deficit_key, tenant_id).await?)
    }

    /// Drop the deficits of tenants missing from `active`. Returns how many were reset.
    pub async fn reset_idle_tenants(&self, active: &HashSet<String>) -> EngineResult<usize> {
        let active: Vec<String> = active.iter().cloned().collect();
        Ok(self
            .store
            .reset_deficits_except(&self.deficit_key, &active)
            .await?)
    }

    /// Current deficits by tenant id.
    pub async fn deficits(&self) -> EngineResult<BTreeMap<String, f64>> {
        Ok(self
            .store
            .hget_all(&self.deficit_key)
            .await?
            .into_iter()
            .filter_map(|(tenant_id, value)| value.parse().ok().map(|deficit| (tenant_id, deficit)))
            .collect())
    }
}
