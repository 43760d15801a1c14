//! Hand-off from a worker queue to a worker.

use tracing::{error, info, warn};

use conveyor_run_backend::RunStatusUpdate;
use conveyor_run_core::{
    ExecutionSnapshot, ExecutionStatus, RunStatus, TaskRun, TaskRunCheckpoint, Waitpoint,
};

use crate::error::EngineResult;
use crate::events::EngineEvent;
use crate::resources::SystemResources;
use crate::run_lock::RunLockGuard;
use crate::run_queue::WorkerQueueEntry;
use crate::snapshots::{CreateSnapshot, ExecutionSnapshotSystem};

/// A run handed to a worker, with what it needs to start or restore.
#[derive(Debug, Clone)]
pub struct DequeuedMessage {
    pub run: TaskRun,
    pub snapshot: ExecutionSnapshot,
    pub checkpoint: Option<TaskRunCheckpoint>,
    pub completed_waitpoints: Vec<Waitpoint>,
    /// Queue-level delivery attempt of the message.
    pub delivery_attempt: u32,
}

#[derive(Clone)]
pub struct DequeueSystem {
    resources: SystemResources,
    snapshots: ExecutionSnapshotSystem,
}

impl DequeueSystem {
    pub fn new(resources: SystemResources, snapshots: ExecutionSnapshotSystem) -> Self {
        Self {
            resources,
            snapshots,
        }
    }

    /// Pop worker queue entries until one yields a run to start. Runs that
    /// were re-queued while their runner is alive go straight back to
    /// EXECUTING and the runner is notified instead.
    pub async fn dequeue_from_worker_queue(
        &self,
        worker_queue: &str,
    ) -> EngineResult<Option<DequeuedMessage>> {
        loop {
            let Some(entry) = self
                .resources
                .run_queue
                .dequeue_from_worker_queue(worker_queue)
                .await?
            else {
                return Ok(None);
            };

            let run_id = entry.run_id;
            let Some(run) = self.resources.backend.get_run(run_id).await? else {
                error!(%run_id, "worker queue entry for unknown run, acknowledging");
                let descriptor = entry.descriptor(self.resources.run_queue.keys())?;
                self.resources
                    .run_queue
                    .acknowledge_message(&descriptor, run_id)
                    .await?;
                continue;
            };

            let dequeued = self
                .resources
                .run_lock
                .lock(run_id, |guard| async move {
                    self.dequeue_locked(&guard, run, entry).await
                })
                .await?;
            if dequeued.is_some() {
                return Ok(dequeued);
            }
        }
    }

    async fn dequeue_locked(
        &self,
        guard: &RunLockGuard,
        run: TaskRun,
        entry: WorkerQueueEntry,
    ) -> EngineResult<Option<DequeuedMessage>> {
        let latest = self.snapshots.get_latest_execution_snapshot(run.id).await?;
        match latest.execution_status {
            ExecutionStatus::Queued => {
                let run = self
                    .resources
                    .backend
                    .update_run_status(&RunStatusUpdate {
                        run_id: run.id,
                        status: RunStatus::Dequeued,
                        attempt_number: None,
                    })
                    .await?;
                self.resources.events.emit(EngineEvent::RunStatusChanged {
                    run_id: run.id,
                    status: run.status,
                    time: run.updated_at,
                });

                let snapshot = self
                    .snapshots
                    .create_execution_snapshot(
                        guard,
                        &run,
                        CreateSnapshot::new(
                            ExecutionStatus::PendingExecuting,
                            &run,
                            "Run was dequeued for execution",
                        )
                        .with_checkpoint(latest.checkpoint_id)
                        .with_completed_waitpoints(latest.completed_waitpoints.clone()),
                    )
                    .await?;

                let checkpoint = match snapshot.checkpoint_id {
                    Some(checkpoint_id) => {
                        self.resources.backend.get_checkpoint(checkpoint_id).await?
                    }
                    None => None,
                };
                let mut completed_waitpoints = Vec::with_capacity(snapshot.completed_waitpoints.len());
                for waitpoint_id in &snapshot.completed_waitpoints {
                    if let Some(waitpoint) = self.resources.backend.get_waitpoint(*waitpoint_id).await? {
                        completed_waitpoints.push(waitpoint);
                    }
                }

                info!(run_id = %run.id, snapshot_id = %snapshot.id, "run dequeued");
                Ok(Some(DequeuedMessage {
                    run,
                    snapshot,
                    checkpoint,
                    completed_waitpoints,
                    delivery_attempt: entry.attempt,
                }))
            }
            ExecutionStatus::QueuedExecuting => {
                let snapshot = self
                    .snapshots
                    .create_execution_snapshot(
                        guard,
                        &run,
                        CreateSnapshot::new(
                            ExecutionStatus::Executing,
                            &run,
                            "Run was continued, whilst still executing",
                        )
                        .with_completed_waitpoints(latest.completed_waitpoints.clone()),
                    )
                    .await?;
                self.resources.events.emit(EngineEvent::WorkerNotification {
                    run_id: run.id,
                    snapshot_id: snapshot.id,
                    execution_status: snapshot.execution_status,
                });
                info!(run_id = %run.id, snapshot_id = %snapshot.id, "executing run continued from queue");
                Ok(None)
            }
            status if status.is_terminal() || status == ExecutionStatus::PendingCancel => {
                warn!(run_id = %run.id, %status, "dropping queued message for finished run");
                self.resources
                    .run_queue
                    .acknowledge_message(&run.queue_descriptor(), run.id)
                    .await?;
                Ok(None)
            }
            status => {
                warn!(run_id = %run.id, %status, "skipping worker queue entry in unexpected state");
                Ok(None)
            }
        }
    }
}
