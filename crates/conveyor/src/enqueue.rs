//! Re-admission of a run into the run queue.

use tracing::info;

use conveyor_run_core::{CheckpointId, ExecutionSnapshot, ExecutionStatus, TaskRun, WaitpointId};

use crate::error::{EngineError, EngineResult};
use crate::now_ms;
use crate::resources::SystemResources;
use crate::run_lock::RunLockGuard;
use crate::run_queue::QueueMessage;
use crate::snapshots::{CreateSnapshot, ExecutionSnapshotSystem};

#[derive(Debug, Clone)]
pub struct EnqueueRun {
    pub run: TaskRun,
    /// QUEUED, or QUEUED_EXECUTING for a run whose runner is still alive.
    pub execution_status: ExecutionStatus,
    pub description: String,
    pub checkpoint_id: Option<CheckpointId>,
    pub completed_waitpoints: Vec<WaitpointId>,
    /// Availability time; now when unset.
    pub timestamp_ms: Option<i64>,
}

impl EnqueueRun {
    pub fn new(run: TaskRun, execution_status: ExecutionStatus, description: impl Into<String>) -> Self {
        Self {
            run,
            execution_status,
            description: description.into(),
            checkpoint_id: None,
            completed_waitpoints: Vec::new(),
            timestamp_ms: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint_id: Option<CheckpointId>) -> Self {
        self.checkpoint_id = checkpoint_id;
        self
    }

    pub fn with_completed_waitpoints(mut self, waitpoints: Vec<WaitpointId>) -> Self {
        self.completed_waitpoints = waitpoints;
        self
    }

    pub fn available_at(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }
}

#[derive(Clone)]
pub struct EnqueueSystem {
    resources: SystemResources,
    snapshots: ExecutionSnapshotSystem,
}

impl EnqueueSystem {
    pub fn new(resources: SystemResources, snapshots: ExecutionSnapshotSystem) -> Self {
        Self {
            resources,
            snapshots,
        }
    }

    /// Record the queued snapshot, then put the run's message on its queue.
    pub async fn enqueue_run(
        &self,
        guard: &RunLockGuard,
        request: EnqueueRun,
    ) -> EngineResult<ExecutionSnapshot> {
        if !matches!(
            request.execution_status,
            ExecutionStatus::Queued | ExecutionStatus::QueuedExecuting
        ) {
            return Err(EngineError::integrity(format!(
                "cannot enqueue run {} as {}",
                request.run.id, request.execution_status
            )));
        }

        let run = request.run;
        let snapshot = self
            .snapshots
            .create_execution_snapshot(
                guard,
                &run,
                CreateSnapshot::new(request.execution_status, &run, request.description)
                    .with_checkpoint(request.checkpoint_id)
                    .with_completed_waitpoints(request.completed_waitpoints),
            )
            .await?;

        let message = QueueMessage::for_run(&run, request.timestamp_ms.unwrap_or_else(now_ms));
        self.resources.run_queue.enqueue_message(&message).await?;
        info!(
            run_id = %run.id,
            snapshot_id = %snapshot.id,
            status = %snapshot.execution_status,
            queue = %run.queue,
            "run enqueued"
        );
        Ok(snapshot)
    }
}
