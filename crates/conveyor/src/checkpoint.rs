//! Checkpoint creation and resumption.
//!
//! Taking a checkpoint can outlast the run's blocked state: by the time the
//! image exists the run may already have been re-queued for immediate
//! execution. A checkpoint for the snapshot just before a QUEUED_EXECUTING
//! latest is therefore still accepted; any other mismatch is discarded.

use serde::Serialize;
use tracing::{info, warn};

use conveyor_run_backend::{CreateCheckpointRecord, RunStatusUpdate};
use conveyor_run_core::{
    CheckpointId, CheckpointInput, ExecutionStatus, RunId, RunStatus, SnapshotId,
    SnapshotSummary, TaskRun,
};

use crate::enqueue::{EnqueueRun, EnqueueSystem};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::release_concurrency::ReleaseConcurrencySystem;
use crate::resources::SystemResources;
use crate::run_lock::RunLockGuard;
use crate::snapshots::{CreateSnapshot, ExecutionSnapshotSystem};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CreateCheckpointResult {
    Created {
        run_id: RunId,
        snapshot: SnapshotSummary,
        checkpoint_id: CheckpointId,
    },
    /// The checkpoint arrived too late or for a state that cannot suspend.
    Discarded {
        run_id: RunId,
        snapshot_id: SnapshotId,
        reason: String,
    },
}

impl CreateCheckpointResult {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContinueRunExecutionResult {
    pub run_id: RunId,
    pub snapshot: SnapshotSummary,
}

#[derive(Clone)]
pub struct CheckpointSystem {
    resources: SystemResources,
    snapshots: ExecutionSnapshotSystem,
    enqueue: EnqueueSystem,
    release: ReleaseConcurrencySystem,
}

impl CheckpointSystem {
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

    pub async fn create_checkpoint(
        &self,
        run_id: RunId,
        snapshot_id: SnapshotId,
        checkpoint: CheckpointInput,
    ) -> EngineResult<CreateCheckpointResult> {
        self.resources
            .run_lock
            .lock(run_id, |guard| async move {
                self.create_checkpoint_locked(&guard, run_id, snapshot_id, checkpoint)
                    .await
            })
            .await
    }

    async fn create_checkpoint_locked(
        &self,
        guard: &RunLockGuard,
        run_id: RunId,
        snapshot_id: SnapshotId,
        checkpoint: CheckpointInput,
    ) -> EngineResult<CreateCheckpointResult> {
        let run = self.get_run(run_id).await?;
        let latest = self.snapshots.get_latest_execution_snapshot(run_id).await?;

        let is_latest = latest.id == snapshot_id;
        let requeued_since = latest.previous_snapshot_id == Some(snapshot_id)
            && latest.execution_status == ExecutionStatus::QueuedExecuting;
        if !is_latest && !requeued_since {
            return Ok(self.discard(run_id, snapshot_id, checkpoint, "Not the latest snapshot".to_string()));
        }
        if !latest.execution_status.is_checkpointable() {
            let reason = format!("Status {} is not checkpointable", latest.execution_status);
            return Ok(self.discard(run_id, snapshot_id, checkpoint, reason));
        }
        let validated = if is_latest {
            latest.clone()
        } else {
            self.snapshots.get_snapshot(snapshot_id).await?
        };

        let run = self.mark_waiting_to_resume(&run).await?;
        let stored = self
            .resources
            .backend
            .create_checkpoint(&CreateCheckpointRecord {
                run: run.clone(),
                input: checkpoint,
            })
            .await?;

        let snapshot = if latest.execution_status == ExecutionStatus::QueuedExecuting {
            self.enqueue
                .enqueue_run(
                    guard,
                    EnqueueRun::new(
                        run,
                        ExecutionStatus::Queued,
                        "Run was re-queued with a checkpoint",
                    )
                    .with_checkpoint(Some(stored.id))
                    .with_completed_waitpoints(latest.completed_waitpoints.clone()),
                )
                .await?
        } else {
            let snapshot = self
                .snapshots
                .create_execution_snapshot(
                    guard,
                    &run,
                    CreateSnapshot::new(ExecutionStatus::Suspended, &run, "Run was suspended after creating a checkpoint")
                        .with_checkpoint(Some(stored.id))
                        .with_completed_waitpoints(latest.completed_waitpoints.clone()),
                )
                .await?;
            self.resources.events.emit(EngineEvent::RunSuspended {
                run_id,
                snapshot_id: snapshot.id,
                checkpoint_id: stored.id,
            });
            snapshot
        };

        self.release.refill_tokens_for_snapshot(&validated).await?;
        info!(
            %run_id,
            checkpoint_id = %stored.id,
            snapshot_id = %snapshot.id,
            status = %snapshot.execution_status,
            "checkpoint created"
        );
        Ok(CreateCheckpointResult::Created {
            run_id,
            snapshot: SnapshotSummary::from(&snapshot),
            checkpoint_id: stored.id,
        })
    }

    fn discard(
        &self,
        run_id: RunId,
        snapshot_id: SnapshotId,
        checkpoint: CheckpointInput,
        reason: String,
    ) -> CreateCheckpointResult {
        warn!(%run_id, %snapshot_id, %reason, "checkpoint discarded");
        self.resources.events.emit(EngineEvent::CheckpointDiscarded {
            run_id,
            snapshot_id,
            checkpoint,
            reason: reason.clone(),
        });
        CreateCheckpointResult::Discarded {
            run_id,
            snapshot_id,
            reason,
        }
    }

    /// Resume a dequeued run; requires exactly the latest snapshot.
    pub async fn continue_run_execution(
        &self,
        run_id: RunId,
        snapshot_id: SnapshotId,
    ) -> EngineResult<ContinueRunExecutionResult> {
        self.resources
            .run_lock
            .lock(run_id, |guard| async move {
                self.continue_run_execution_locked(&guard, run_id, snapshot_id)
                    .await
            })
            .await
    }

    async fn continue_run_execution_locked(
        &self,
        guard: &RunLockGuard,
        run_id: RunId,
        snapshot_id: SnapshotId,
    ) -> EngineResult<ContinueRunExecutionResult> {
        self.get_run(run_id).await?;
        let latest = self.snapshots.get_latest_execution_snapshot(run_id).await?;
        if latest.id != snapshot_id {
            return Err(EngineError::validation(400, "Not the latest snapshot"));
        }
        if !latest.execution_status.is_pending_executing() {
            return Err(EngineError::validation(
                400,
                format!("Status {} is not pending executing", latest.execution_status),
            ));
        }

        let run = self
            .resources
            .backend
            .update_run_status(&RunStatusUpdate {
                run_id,
                status: RunStatus::Executing,
                attempt_number: None,
            })
            .await?;
        self.resources.events.emit(EngineEvent::RunStatusChanged {
            run_id,
            status: run.status,
            time: run.updated_at,
        });

        let snapshot = self
            .snapshots
            .create_execution_snapshot(
                guard,
                &run,
                CreateSnapshot::new(ExecutionStatus::Executing, &run, "Run was resumed from checkpoint")
                    .with_completed_waitpoints(latest.completed_waitpoints),
            )
            .await?;
        self.resources.events.emit(EngineEvent::WorkerNotification {
            run_id,
            snapshot_id: snapshot.id,
            execution_status: snapshot.execution_status,
        });
        info!(%run_id, snapshot_id = %snapshot.id, "run execution continued");
        Ok(ContinueRunExecutionResult {
            run_id,
            snapshot: SnapshotSummary::from(&snapshot),
        })
    }

    async fn get_run(&self, run_id: RunId) -> EngineResult<TaskRun> {
        self.resources
            .backend
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    async fn mark_waiting_to_resume(&self, run: &TaskRun) -> EngineResult<TaskRun> {
        let run = self
            .resources
            .backend
            .update_run_status(&RunStatusUpdate {
                run_id: run.id,
                status: RunStatus::WaitingToResume,
                attempt_number: None,
            })
            .await?;
        self.resources.events.emit(EngineEvent::RunStatusChanged {
            run_id: run.id,
            status: run.status,
            time: run.updated_at,
        });
        Ok(run)
    }
}
