//! Deferred release of a blocked run's concurrency.
//!
//! A run that blocks on waitpoints or suspends gives its concurrency back, but
//! only as fast as its environment's token bucket allows; a burst of blocks
//! would otherwise return a burst of capacity at once. Development environments
//! skip the bucket. Every deferred release is revalidated under the run lock
//! when it finally executes, since the run may have moved on in the meantime.

mod sweeper;
mod token_bucket;

use tracing::{debug, error, info, warn};

use conveyor_run_core::{
    EnvironmentType, ExecutionSnapshot, ExecutionStatus, ReleaseConcurrencyScope, SnapshotId,
    TaskRun, TenantDescriptor,
};
use conveyor_shared_store::{RefillOutcome, ReleaseAttempt};

pub use self::sweeper::ReleaseConcurrencySweeper;
pub use self::token_bucket::{ReleaseTokenBucket, bucket_capacity};

use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::now_ms;
use crate::resources::SystemResources;
use crate::run_lock::RunLockGuard;
use crate::snapshots::ExecutionSnapshotSystem;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(ReleaseConcurrencyScope),
    /// Nothing was released; the reason is for logs and callers.
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseDecision {
    Executed(ReleaseOutcome),
    /// Parked until the environment's bucket has a token.
    Deferred,
    Disabled,
}

#[derive(Clone)]
pub struct ReleaseConcurrencySystem {
    resources: SystemResources,
    snapshots: ExecutionSnapshotSystem,
    bucket: ReleaseTokenBucket,
}

impl ReleaseConcurrencySystem {
    pub fn new(resources: SystemResources, snapshots: ExecutionSnapshotSystem) -> Self {
        let bucket = ReleaseTokenBucket::new(
            resources.store.clone(),
            resources.run_queue.clone(),
            resources.config.release_concurrency.max_tokens_ratio,
        );
        Self {
            resources,
            snapshots,
            bucket,
        }
    }

    pub fn bucket(&self) -> &ReleaseTokenBucket {
        &self.bucket
    }

    /// Release now, or park the snapshot until its bucket has a token.
    pub async fn release_concurrency_for_snapshot(
        &self,
        snapshot: &ExecutionSnapshot,
    ) -> EngineResult<ReleaseDecision> {
        if self.resources.config.release_concurrency.disabled {
            debug!(snapshot_id = %snapshot.id, "release concurrency disabled");
            return Ok(ReleaseDecision::Disabled);
        }

        if snapshot.environment_type == EnvironmentType::Development {
            let outcome = self.execute_release_concurrency_for_snapshot(snapshot.id).await?;
            return Ok(ReleaseDecision::Executed(outcome));
        }

        let tenant = snapshot.tenant();
        match self
            .bucket
            .attempt_to_release(&tenant, snapshot.id, now_ms())
            .await?
        {
            ReleaseAttempt::Consumed => {
                let outcome = self
                    .execute_or_return_token(&tenant, &snapshot.id.to_string(), snapshot.id)
                    .await?;
                Ok(ReleaseDecision::Executed(outcome))
            }
            ReleaseAttempt::Queued => {
                info!(run_id = %snapshot.run_id, snapshot_id = %snapshot.id, "concurrency release deferred");
                Ok(ReleaseDecision::Deferred)
            }
        }
    }

    /// Execute a release that holds a token; the token goes back if nothing was released.
    pub(crate) async fn execute_or_return_token(
        &self,
        tenant: &TenantDescriptor,
        releaser_id: &str,
        snapshot_id: SnapshotId,
    ) -> EngineResult<ReleaseOutcome> {
        match self.execute_release_concurrency_for_snapshot(snapshot_id).await {
            Ok(ReleaseOutcome::Released(scope)) => Ok(ReleaseOutcome::Released(scope)),
            Ok(ReleaseOutcome::Skipped(reason)) => {
                self.bucket.return_token(tenant, releaser_id).await?;
                Ok(ReleaseOutcome::Skipped(reason))
            }
            Err(err) => {
                error!(%snapshot_id, error = %err, "release concurrency failed, returning token");
                self.bucket.return_token(tenant, releaser_id).await?;
                Err(err)
            }
        }
    }

    /// Revalidate under the run lock and free the run's concurrency slots.
    pub async fn execute_release_concurrency_for_snapshot(
        &self,
        snapshot_id: SnapshotId,
    ) -> EngineResult<ReleaseOutcome> {
        let snapshot = self.snapshots.get_snapshot(snapshot_id).await?;
        self.resources
            .run_lock
            .lock(snapshot.run_id, |guard| async move {
                self.execute_release_locked(&guard, snapshot).await
            })
            .await
    }

    async fn execute_release_locked(
        &self,
        guard: &RunLockGuard,
        snapshot: ExecutionSnapshot,
    ) -> EngineResult<ReleaseOutcome> {
        guard.ensure_holds(snapshot.run_id)?;
        let latest = self
            .snapshots
            .get_latest_execution_snapshot(snapshot.run_id)
            .await?;

        let is_latest = latest.id == snapshot.id;
        let suspended_since = latest.previous_snapshot_id == Some(snapshot.id)
            && latest.execution_status == ExecutionStatus::Suspended;
        if !is_latest && !suspended_since {
            warn!(run_id = %snapshot.run_id, snapshot_id = %snapshot.id, "skipping release for stale snapshot");
            return Ok(ReleaseOutcome::Skipped("Not the latest snapshot".to_string()));
        }
        if !latest.execution_status.can_release_concurrency() {
            return Ok(ReleaseOutcome::Skipped(format!(
                "Status {} cannot release concurrency",
                latest.execution_status
            )));
        }

        let run = self
            .resources
            .backend
            .get_run(snapshot.run_id)
            .await?
            .ok_or(EngineError::RunNotFound(snapshot.run_id))?;
        let scope = match snapshot
            .metadata
            .release_concurrency
            .or(latest.metadata.release_concurrency)
        {
            Some(scope) => scope,
            None => self.resolve_release_scope(&run).await?,
        };

        let queue = &self.resources.run_queue;
        let descriptor = run.queue_descriptor();
        match scope {
            ReleaseConcurrencyScope::All => {
                queue
                    .release_all_concurrency(&descriptor, snapshot.run_id)
                    .await?
            }
            ReleaseConcurrencyScope::EnvironmentOnly => {
                queue
                    .release_env_concurrency(&descriptor.tenant(), snapshot.run_id)
                    .await?
            }
        }

        info!(run_id = %snapshot.run_id, snapshot_id = %snapshot.id, ?scope, "concurrency released");
        self.resources.events.emit(EngineEvent::ConcurrencyReleased {
            run_id: snapshot.run_id,
            snapshot_id: snapshot.id,
            scope,
        });
        Ok(ReleaseOutcome::Released(scope))
    }

    /// Queues without a limit, or configured to release on block, give back
    /// both slots; other queues keep their queue slot.
    pub async fn resolve_release_scope(&self, run: &TaskRun) -> EngineResult<ReleaseConcurrencyScope> {
        let Some(queue_id) = run.locked_queue_id else {
            return Ok(ReleaseConcurrencyScope::All);
        };
        let scope = match self.resources.backend.get_queue(queue_id).await? {
            Some(queue)
                if queue.concurrency_limit.is_some() && !queue.release_concurrency_on_waitpoint =>
            {
                ReleaseConcurrencyScope::EnvironmentOnly
            }
            _ => ReleaseConcurrencyScope::All,
        };
        Ok(scope)
    }

    /// True when the run has moved past `releaser_id`, so its token should go
    /// back rather than stay consumed. Unknown snapshots refill too.
    pub async fn validate_snapshot_should_refill_token(
        &self,
        releaser_id: SnapshotId,
    ) -> EngineResult<bool> {
        let Some(snapshot) = self.resources.backend.get_snapshot(releaser_id).await? else {
            warn!(%releaser_id, "release token held by unknown snapshot");
            return Ok(true);
        };
        let latest = self
            .snapshots
            .get_latest_execution_snapshot(snapshot.run_id)
            .await?;
        Ok(latest.id != releaser_id)
    }

    pub async fn consume_token(
        &self,
        tenant: &TenantDescriptor,
        releaser_id: SnapshotId,
    ) -> EngineResult<bool> {
        self.bucket.consume_token(tenant, releaser_id, now_ms()).await
    }

    pub async fn return_token(
        &self,
        tenant: &TenantDescriptor,
        releaser_id: SnapshotId,
    ) -> EngineResult<f64> {
        self.bucket
            .return_token(tenant, &releaser_id.to_string())
            .await
    }

    /// Give back the token the snapshot consumed when it released.
    pub async fn refill_tokens_for_snapshot(
        &self,
        snapshot: &ExecutionSnapshot,
    ) -> EngineResult<RefillOutcome> {
        self.refill(snapshot, false).await
    }

    /// The run moved on: refill a consumed token, or drop a release that is
    /// still parked.
    pub async fn discard_release_for_snapshot(
        &self,
        snapshot: &ExecutionSnapshot,
    ) -> EngineResult<RefillOutcome> {
        self.refill(snapshot, true).await
    }

    async fn refill(
        &self,
        snapshot: &ExecutionSnapshot,
        cancel_parked: bool,
    ) -> EngineResult<RefillOutcome> {
        if snapshot.environment_type == EnvironmentType::Development {
            return Ok(RefillOutcome::NotFound);
        }
        let outcome = self
            .bucket
            .refill_releaser(&snapshot.tenant(), snapshot.id, cancel_parked)
            .await?;
        debug!(snapshot_id = %snapshot.id, ?outcome, cancel_parked, "release token refill");
        Ok(outcome)
    }
}
