//! Per-environment token buckets bounding how fast blocked runs give back
//! concurrency.
//!
//! Each bucket is keyed by the environment key and holds up to
//! `floor(env limit * ratio)` tokens (at least one). Releasers are snapshot
//! ids. A releaser that finds the bucket empty is parked until the sweeper
//! sees a free token.

use std::sync::Arc;

use conveyor_run_core::{SnapshotId, TenantDescriptor};
use conveyor_shared_store::{
    ClaimedReleaser, RefillOutcome, ReleaseAttempt, SharedStore, TokenBucketKeyspace,
};

use crate::error::EngineResult;
use crate::run_queue::RunQueue;

#[derive(Clone)]
pub struct ReleaseTokenBucket {
    store: Arc<dyn SharedStore>,
    run_queue: RunQueue,
    keyspace: TokenBucketKeyspace,
    max_tokens_ratio: f64,
}

impl ReleaseTokenBucket {
    pub fn new(store: Arc<dyn SharedStore>, run_queue: RunQueue, max_tokens_ratio: f64) -> Self {
        let keyspace = run_queue.keys().release_concurrency_keyspace();
        Self {
            store,
            run_queue,
            keyspace,
            max_tokens_ratio,
        }
    }

    pub fn keyspace(&self) -> &TokenBucketKeyspace {
        &self.keyspace
    }

    pub fn member(&self, tenant: &TenantDescriptor) -> EngineResult<String> {
        Ok(self.run_queue.keys().env_key(tenant)?)
    }

    pub fn tenant_for_member(&self, member: &str) -> EngineResult<TenantDescriptor> {
        Ok(self.run_queue.keys().tenant_from_env_key(member)?)
    }

    /// Bucket capacity for the tenant's environment.
    pub async fn max_tokens(&self, tenant: &TenantDescriptor) -> EngineResult<f64> {
        let limit = self.run_queue.env_concurrency_limit(tenant).await?;
        Ok(bucket_capacity(limit, self.max_tokens_ratio))
    }

    pub async fn attempt_to_release(
        &self,
        tenant: &TenantDescriptor,
        releaser_id: SnapshotId,
        now_ms: i64,
    ) -> EngineResult<ReleaseAttempt> {
        let member = self.member(tenant)?;
        let max_tokens = self.max_tokens(tenant).await?;
        Ok(self
            .store
            .attempt_release(&self.keyspace, &member, &releaser_id.to_string(), max_tokens, now_ms)
            .await?)
    }

    pub async fn consume_token(
        &self,
        tenant: &TenantDescriptor,
        releaser_id: SnapshotId,
        now_ms: i64,
    ) -> EngineResult<bool> {
        let member = self.member(tenant)?;
        let max_tokens = self.max_tokens(tenant).await?;
        Ok(self
            .store
            .consume_token(&self.keyspace, &member, &releaser_id.to_string(), max_tokens, now_ms)
            .await?)
    }

    pub async fn return_token(
        &self,
        tenant: &TenantDescriptor,
        releaser_id: &str,
    ) -> EngineResult<f64> {
        let member = self.member(tenant)?;
        let max_tokens = self.max_tokens(tenant).await?;
        Ok(self
            .store
            .return_token(&self.keyspace, &member, releaser_id, max_tokens)
            .await?)
    }

    pub async fn refill_releaser(
        &self,
        tenant: &TenantDescriptor,
        releaser_id: SnapshotId,
        cancel_parked: bool,
    ) -> EngineResult<RefillOutcome> {
        let member = self.member(tenant)?;
        let max_tokens = self.max_tokens(tenant).await?;
        Ok(self
            .store
            .refill_releaser(
                &self.keyspace,
                &member,
                &releaser_id.to_string(),
                max_tokens,
                cancel_parked,
            )
            .await?)
    }

    pub async fn refill_tokens(&self, tenant: &TenantDescriptor, amount: f64) -> EngineResult<f64> {
        let member = self.member(tenant)?;
        let max_tokens = self.max_tokens(tenant).await?;
        Ok(self
            .store
            .refill_tokens(&self.keyspace, &member, amount, max_tokens)
            .await?)
    }

    pub async fn claim_ready_releasers(
        &self,
        limit: usize,
        now_ms: i64,
    ) -> EngineResult<Vec<ClaimedReleaser>> {
        Ok(self
            .store
            .claim_ready_releasers(&self.keyspace, limit, now_ms)
            .await?)
    }

    pub async fn stale_releasings(
        &self,
        older_than_ms: i64,
        limit: usize,
    ) -> EngineResult<Vec<ClaimedReleaser>> {
        Ok(self
            .store
            .stale_releasings(&self.keyspace, older_than_ms, limit)
            .await?)
    }

    pub async fn touch_releasing(&self, releaser_id: &str, now_ms: i64) -> EngineResult<()> {
        Ok(self
            .store
            .touch_releasing(&self.keyspace, releaser_id, now_ms)
            .await?)
    }
}

pub fn bucket_capacity(env_limit: u32, ratio: f64) -> f64 {
    (f64::from(env_limit) * ratio).floor().max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_floored_with_a_minimum_of_one() {
        assert_eq!(bucket_capacity(10, 1.0), 10.0);
        assert_eq!(bucket_capacity(10, 0.55), 5.0);
        assert_eq!(bucket_capacity(1, 0.5), 1.0);
        assert_eq!(bucket_capacity(0, 1.0), 1.0);
    }
}
