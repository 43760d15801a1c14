use conveyor_backends_core::BackendResult;
use conveyor_shared_store::{
    ClaimedReleaser, RefillOutcome, ReleaseAttempt, TokenBucketKeyspace, TokenBucketScripts,
};

use crate::MemorySharedStore;
use crate::keyspace::Keyspace;

fn tokens(
    keyspace: &Keyspace,
    buckets: &TokenBucketKeyspace,
    member: &str,
    max_tokens: f64,
) -> BackendResult<f64> {
    Ok(keyspace
        .get_f64(&buckets.bucket_key(member))?
        .map_or(max_tokens, |tokens| tokens.min(max_tokens)))
}

fn set_tokens(keyspace: &mut Keyspace, buckets: &TokenBucketKeyspace, member: &str, value: f64) {
    keyspace.set(&buckets.bucket_key(member), value.to_string());
}

fn record_releasing(
    keyspace: &mut Keyspace,
    buckets: &TokenBucketKeyspace,
    member: &str,
    releaser_id: &str,
    now_ms: i64,
) {
    keyspace.zadd(&buckets.releasings_key, releaser_id, now_ms as f64);
    keyspace.hset(&buckets.releasings_meta_key, releaser_id, member);
}

fn forget_releasing(keyspace: &mut Keyspace, buckets: &TokenBucketKeyspace, releaser_id: &str) -> bool {
    keyspace.hdel(&buckets.releasings_meta_key, releaser_id);
    keyspace.zrem(&buckets.releasings_key, releaser_id)
}

/// Removes a parked releaser and keeps the bucket's master queue entry in sync.
fn unpark(keyspace: &mut Keyspace, buckets: &TokenBucketKeyspace, member: &str, releaser_id: &str) -> bool {
    let pending_key = buckets.pending_key(member);
    let removed = keyspace.zrem(&pending_key, releaser_id);
    match keyspace.zfirst(&pending_key) {
        Some((_, score)) => keyspace.zadd(&buckets.master_key, member, score),
        None => {
            keyspace.zrem(&buckets.master_key, member);
        }
    }
    removed
}

fn take_token(
    keyspace: &mut Keyspace,
    buckets: &TokenBucketKeyspace,
    member: &str,
    releaser_id: &str,
    max_tokens: f64,
    now_ms: i64,
) -> BackendResult<bool> {
    let available = tokens(keyspace, buckets, member, max_tokens)?;
    if available < 1.0 {
        return Ok(false);
    }
    set_tokens(keyspace, buckets, member, available - 1.0);
    record_releasing(keyspace, buckets, member, releaser_id, now_ms);
    Ok(true)
}

fn give_back(
    keyspace: &mut Keyspace,
    buckets: &TokenBucketKeyspace,
    member: &str,
    amount: f64,
    max_tokens: f64,
) -> BackendResult<f64> {
    let next = (tokens(keyspace, buckets, member, max_tokens)? + amount).min(max_tokens);
    set_tokens(keyspace, buckets, member, next);
    Ok(next)
}

#[async_trait::async_trait]
impl TokenBucketScripts for MemorySharedStore {
    async fn attempt_release(
        &self,
        buckets: &TokenBucketKeyspace,
        member: &str,
        releaser_id: &str,
        max_tokens: f64,
        now_ms: i64,
    ) -> BackendResult<ReleaseAttempt> {
        let mut keyspace = self.keyspace();
        if take_token(&mut keyspace, buckets, member, releaser_id, max_tokens, now_ms)? {
            return Ok(ReleaseAttempt::Consumed);
        }
        let pending_key = buckets.pending_key(member);
        if keyspace.zscore(&pending_key, releaser_id).is_none() {
            keyspace.zadd(&pending_key, releaser_id, now_ms as f64);
        }
        if let Some((_, score)) = keyspace.zfirst(&pending_key) {
            keyspace.zadd(&buckets.master_key, member, score);
        }
        Ok(ReleaseAttempt::Queued)
    }

    async fn consume_token(
        &self,
        buckets: &TokenBucketKeyspace,
        member: &str,
        releaser_id: &str,
        max_tokens: f64,
        now_ms: i64,
    ) -> BackendResult<bool> {
        let mut keyspace = self.keyspace();
        take_token(&mut keyspace, buckets, member, releaser_id, max_tokens, now_ms)
    }

    async fn return_token(
        &self,
        buckets: &TokenBucketKeyspace,
        member: &str,
        releaser_id: &str,
        max_tokens: f64,
    ) -> BackendResult<f64> {
        let mut keyspace = self.keyspace();
        forget_releasing(&mut keyspace, buckets, releaser_id);
        unpark(&mut keyspace, buckets, member, releaser_id);
        give_back(&mut keyspace, buckets, member, 1.0, max_tokens)
    }

    async fn refill_releaser(
        &self,
        buckets: &TokenBucketKeyspace,
        member: &str,
        releaser_id: &str,
        max_tokens: f64,
        cancel_parked: bool,
    ) -> BackendResult<RefillOutcome> {
        let mut keyspace = self.keyspace();
        if forget_releasing(&mut keyspace, buckets, releaser_id) {
            give_back(&mut keyspace, buckets, member, 1.0, max_tokens)?;
            return Ok(RefillOutcome::Refilled);
        }
        if cancel_parked && unpark(&mut keyspace, buckets, member, releaser_id) {
            return Ok(RefillOutcome::Cancelled);
        }
        Ok(RefillOutcome::NotFound)
    }

    async fn refill_tokens(
        &self,
        buckets: &TokenBucketKeyspace,
        member: &str,
        amount: f64,
        max_tokens: f64,
    ) -> BackendResult<f64> {
        let mut keyspace = self.keyspace();
        give_back(&mut keyspace, buckets, member, amount, max_tokens)
    }

    async fn claim_ready_releasers(
        &self,
        buckets: &TokenBucketKeyspace,
        limit: usize,
        now_ms: i64,
    ) -> BackendResult<Vec<ClaimedReleaser>> {
        let mut keyspace = self.keyspace();
        let mut claimed = Vec::new();
        for (member, _) in keyspace.zordered(&buckets.master_key) {
            if claimed.len() >= limit {
                break;
            }
            // Parked releasers only exist while their bucket was drained, so
            // the bucket key is always present here.
            let mut available = keyspace.get_f64(&buckets.bucket_key(&member))?.unwrap_or(0.0);
            let pending_key = buckets.pending_key(&member);
            while available >= 1.0 && claimed.len() < limit {
                let Some((releaser_id, _)) = keyspace.zfirst(&pending_key) else {
                    break;
                };
                unpark(&mut keyspace, buckets, &member, &releaser_id);
                available -= 1.0;
                set_tokens(&mut keyspace, buckets, &member, available);
                record_releasing(&mut keyspace, buckets, &member, &releaser_id, now_ms);
                claimed.push(ClaimedReleaser {
                    member: member.clone(),
                    releaser_id,
                });
            }
        }
        Ok(claimed)
    }

    async fn stale_releasings(
        &self,
        buckets: &TokenBucketKeyspace,
        older_than_ms: i64,
        limit: usize,
    ) -> BackendResult<Vec<ClaimedReleaser>> {
        let keyspace = self.keyspace();
        Ok(keyspace
            .zrange_by_score(
                &buckets.releasings_key,
                f64::NEG_INFINITY,
                older_than_ms as f64,
                limit,
            )
            .into_iter()
            .filter_map(|(releaser_id, _)| {
                let member = keyspace.hget(&buckets.releasings_meta_key, &releaser_id)?.clone();
                Some(ClaimedReleaser {
                    member,
                    releaser_id,
                })
            })
            .collect())
    }

    async fn touch_releasing(
        &self,
        buckets: &TokenBucketKeyspace,
        releaser_id: &str,
        now_ms: i64,
    ) -> BackendResult<()> {
        let mut keyspace = self.keyspace();
        if keyspace.zscore(&buckets.releasings_key, releaser_id).is_some() {
            keyspace.zadd(&buckets.releasings_key, releaser_id, now_ms as f64);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buckets() -> TokenBucketKeyspace {
        TokenBucketKeyspace {
            prefix: "rc:".to_string(),
            master_key: "rc:master".to_string(),
            releasings_key: "rc:releasings".to_string(),
            releasings_meta_key: "rc:releasings:meta".to_string(),
        }
    }

    #[tokio::test]
    async fn bucket_starts_full_then_parks() {
        let store = MemorySharedStore::new();
        let buckets = buckets();
        assert_eq!(
            store.attempt_release(&buckets, "env", "s1", 1.0, 0).await.unwrap(),
            ReleaseAttempt::Consumed
        );
        assert_eq!(
            store.attempt_release(&buckets, "env", "s2", 1.0, 1).await.unwrap(),
            ReleaseAttempt::Queued
        );
        assert!(store.claim_ready_releasers(&buckets, 10, 2).await.unwrap().is_empty());

        assert_eq!(store.return_token(&buckets, "env", "s1", 1.0).await.unwrap(), 1.0);
        let claimed = store.claim_ready_releasers(&buckets, 10, 3).await.unwrap();
        assert_eq!(
            claimed,
            vec![ClaimedReleaser {
                member: "env".to_string(),
                releaser_id: "s2".to_string(),
            }]
        );
        assert_eq!(store.stale_releasings(&buckets, 3, 10).await.unwrap(), claimed);
    }

    #[tokio::test]
    async fn refill_releaser_depends_on_stage() {
        let store = MemorySharedStore::new();
        let buckets = buckets();
        store.attempt_release(&buckets, "env", "held", 1.0, 0).await.unwrap();
        store.attempt_release(&buckets, "env", "parked", 1.0, 0).await.unwrap();

        assert_eq!(
            store.refill_releaser(&buckets, "env", "parked", 1.0, false).await.unwrap(),
            RefillOutcome::NotFound
        );
        assert_eq!(
            store.refill_releaser(&buckets, "env", "parked", 1.0, true).await.unwrap(),
            RefillOutcome::Cancelled
        );
        assert_eq!(
            store.refill_releaser(&buckets, "env", "held", 1.0, true).await.unwrap(),
            RefillOutcome::Refilled
        );
        assert_eq!(
            store.refill_releaser(&buckets, "env", "held", 1.0, true).await.unwrap(),
            RefillOutcome::NotFound
        );
        assert!(store.consume_token(&buckets, "env", "next", 1.0, 5).await.unwrap());
    }

    #[tokio::test]
    async fn refill_is_capped() {
        let store = MemorySharedStore::new();
        let buckets = buckets();
        assert!(store.consume_token(&buckets, "env", "a", 3.0, 0).await.unwrap());
        assert_eq!(store.refill_tokens(&buckets, "env", 5.0, 3.0).await.unwrap(), 3.0);
    }
}
