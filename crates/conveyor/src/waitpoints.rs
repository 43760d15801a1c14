//! Blocking runs on waitpoints and continuing them once unblocked.

use tracing::{error, info, warn};

use conveyor_run_backend::CompleteWaitpointRecord;
use conveyor_run_core::{
    ExecutionSnapshot, ExecutionStatus, RunId, SnapshotMetadata, TenantDescriptor, Waitpoint,
    WaitpointId,
};

use crate::enqueue::{EnqueueRun, EnqueueSystem};
use crate::error::{EngineError, EngineResult};
use crate::release_concurrency::{ReleaseConcurrencySystem, ReleaseDecision};
use crate::resources::SystemResources;
use crate::run_lock::RunLockGuard;
use crate::snapshots::{CreateSnapshot, ExecutionSnapshotSystem};

#[derive(Clone)]
pub struct WaitpointSystem {
    resources: SystemResources,
    snapshots: ExecutionSnapshotSystem,
    enqueue: EnqueueSystem,
    release: ReleaseConcurrencySystem,
}

impl WaitpointSystem {
    pub fn new(
        resources: SystemResources,
        snapshots: ExecutionSnapshotSystem,
        enqueue: EnqueueSystem,
        release: ReleaseConcurrencySystem,
    ) -> Self {
        Self {
            resources,
            snapshots,
            enqueue,
            release,
        }
    }

    pub async fn create_waitpoint(&self, tenant: &TenantDescriptor) -> EngineResult<Waitpoint> {
        Ok(self.resources.backend.create_waitpoint(tenant).await?)
    }

    /// Block an executing run. The run moves to EXECUTING_WITH_WAITPOINTS with
    /// its release scope resolved, then its concurrency release is requested.
    /// If every waitpoint is already complete the run keeps executing.
    pub async fn block_run_with_waitpoints(
        &self,
        run_id: RunId,
        waitpoint_ids: &[WaitpointId],
    ) -> EngineResult<ExecutionSnapshot> {
        let snapshot = self
            .resources
            .run_lock
            .lock(run_id, |guard| async move {
                self.block_run_locked(&guard, run_id, waitpoint_ids).await
            })
            .await?;

        if snapshot.execution_status == ExecutionStatus::ExecutingWithWaitpoints {
            let decision = self.release.release_concurrency_for_snapshot(&snapshot).await?;
            info!(%run_id, snapshot_id = %snapshot.id, ?decision, "run blocked on waitpoints");
        }
        Ok(snapshot)
    }

    async fn block_run_locked(
        &self,
        guard: &RunLockGuard,
        run_id: RunId,
        waitpoint_ids: &[WaitpointId],
    ) -> EngineResult<ExecutionSnapshot> {
        let run = self
            .resources
            .backend
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        let latest = self.snapshots.get_latest_execution_snapshot(run_id).await?;
        if latest.execution_status != ExecutionStatus::Executing {
            return Err(EngineError::validation(
                400,
                format!("Status {} cannot block on waitpoints", latest.execution_status),
            ));
        }

        let state = self
            .resources
            .backend
            .block_run_with_waitpoints(run_id, waitpoint_ids)
            .await?;
        if state.is_unblocked() {
            self.resources.backend.clear_blocking_waitpoints(run_id).await?;
            return Ok(latest);
        }

        let scope = self.release.resolve_release_scope(&run).await?;
        self.snapshots
            .create_execution_snapshot(
                guard,
                &run,
                CreateSnapshot::new(
                    ExecutionStatus::ExecutingWithWaitpoints,
                    &run,
                    "Run is blocked by waitpoints",
                )
                .with_metadata(SnapshotMetadata {
                    release_concurrency: Some(scope),
                }),
            )
            .await
    }

    /// Resolve a waitpoint and continue every run it unblocked.
    pub async fn complete_waitpoint(
        &self,
        waitpoint_id: WaitpointId,
        output: Option<serde_json::Value>,
        output_is_error: bool,
    ) -> EngineResult<Waitpoint> {
        let (waitpoint, run_ids) = self
            .resources
            .backend
            .complete_waitpoint(&CompleteWaitpointRecord {
                waitpoint_id,
                output,
                output_is_error,
            })
            .await?;
        for run_id in run_ids {
            if let Err(err) = self.continue_run_if_unblocked(run_id).await {
                error!(%run_id, %waitpoint_id, error = %err, "failed to continue unblocked run");
            }
        }
        Ok(waitpoint)
    }

    /// Re-enqueue the run if nothing blocks it any more. A run still holding
    /// its runner goes back as QUEUED_EXECUTING; a suspended run as QUEUED
    /// with its checkpoint.
    pub async fn continue_run_if_unblocked(
        &self,
        run_id: RunId,
    ) -> EngineResult<Option<ExecutionSnapshot>> {
        let continued = self
            .resources
            .run_lock
            .lock(run_id, |guard| async move {
                self.continue_run_locked(&guard, run_id).await
            })
            .await?;

        let Some((snapshot, releaser)) = continued else {
            return Ok(None);
        };
        self.release.discard_release_for_snapshot(&releaser).await?;
        Ok(Some(snapshot))
    }

    /// Returns the new snapshot and the blocked snapshot that requested the release.
    async fn continue_run_locked(
        &self,
        guard: &RunLockGuard,
        run_id: RunId,
    ) -> EngineResult<Option<(ExecutionSnapshot, ExecutionSnapshot)>> {
        let state = self.resources.backend.blocking_state(run_id).await?;
        if !state.is_unblocked() {
            return Ok(None);
        }
        let run = self
            .resources
            .backend
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        let latest = self.snapshots.get_latest_execution_snapshot(run_id).await?;

        let (request, releaser) = match latest.execution_status {
            ExecutionStatus::ExecutingWithWaitpoints => (
                EnqueueRun::new(
                    run,
                    ExecutionStatus::QueuedExecuting,
                    "Run can continue, but is waiting for concurrency",
                ),
                latest.clone(),
            ),
            ExecutionStatus::Suspended => {
                let blocked_id = latest.previous_snapshot_id.ok_or_else(|| {
                    EngineError::integrity(format!("suspended snapshot {} has no predecessor", latest.id))
                })?;
                let releaser = self.snapshots.get_snapshot(blocked_id).await?;
                (
                    EnqueueRun::new(run, ExecutionStatus::Queued, "Run was unsuspended")
                        .with_checkpoint(latest.checkpoint_id),
                    releaser,
                )
            }
            status => {
                warn!(%run_id, %status, "unblocked run is not waiting, leaving it");
                return Ok(None);
            }
        };

        let snapshot = self
            .enqueue
            .enqueue_run(
                guard,
                request.with_completed_waitpoints(state.completed.clone()),
            )
            .await?;
        self.resources
            .backend
            .clear_blocking_waitpoints(run_id)
            .await?;
        info!(%run_id, snapshot_id = %snapshot.id, status = %snapshot.execution_status, "run unblocked");
        Ok(Some((snapshot, releaser)))
    }
}
