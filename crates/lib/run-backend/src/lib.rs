//! Relational store contract consumed by the run engine.

mod data;

pub use conveyor_backends_core::{BackendError, BackendResult};
use conveyor_run_core::{
    CheckpointId, ExecutionSnapshot, QueueId, RunId, RuntimeEnvironment, SnapshotId, TaskQueue,
    TaskRun, TaskRunCheckpoint, TenantDescriptor, Waitpoint, WaitpointId,
};

pub use self::data::*;

/// Run, environment, snapshot, checkpoint and waitpoint records.
///
/// Implementations must make `create_snapshot` conditional: the write succeeds
/// only when `expected_previous` equals the run's current latest snapshot id,
/// otherwise it fails with [`BackendError::Conflict`] and writes nothing.
#[async_trait::async_trait]
pub trait RunBackend: Send + Sync {
    async fn create_run(&self, run: &TaskRun) -> BackendResult<()>;

    async fn get_run(&self, run_id: RunId) -> BackendResult<Option<TaskRun>>;

    /// Update the run's status inside one transaction and return the new record.
    async fn update_run_status(&self, update: &RunStatusUpdate) -> BackendResult<TaskRun>;

    async fn upsert_environment(&self, environment: &RuntimeEnvironment) -> BackendResult<()>;

    async fn get_environment(&self, environment_id: &str)
    -> BackendResult<Option<RuntimeEnvironment>>;

    async fn upsert_queue(&self, queue: &TaskQueue) -> BackendResult<()>;

    async fn get_queue(&self, queue_id: QueueId) -> BackendResult<Option<TaskQueue>>;

    /// Append a snapshot to the run's chain.
    async fn create_snapshot(
        &self,
        record: &CreateSnapshotRecord,
    ) -> BackendResult<ExecutionSnapshot>;

    async fn get_snapshot(&self, snapshot_id: SnapshotId)
    -> BackendResult<Option<ExecutionSnapshot>>;

    async fn get_latest_snapshot(&self, run_id: RunId)
    -> BackendResult<Option<ExecutionSnapshot>>;

    /// All snapshots for a run in creation order.
    async fn list_snapshots(&self, run_id: RunId) -> BackendResult<Vec<ExecutionSnapshot>>;

    async fn create_checkpoint(
        &self,
        record: &CreateCheckpointRecord,
    ) -> BackendResult<TaskRunCheckpoint>;

    async fn get_checkpoint(
        &self,
        checkpoint_id: CheckpointId,
    ) -> BackendResult<Option<TaskRunCheckpoint>>;

    async fn create_waitpoint(&self, tenant: &TenantDescriptor) -> BackendResult<Waitpoint>;

    async fn get_waitpoint(&self, waitpoint_id: WaitpointId) -> BackendResult<Option<Waitpoint>>;

    /// Resolve a waitpoint and return the runs that were blocked on it.
    async fn complete_waitpoint(
        &self,
        record: &CompleteWaitpointRecord,
    ) -> BackendResult<(Waitpoint, Vec<RunId>)>;

    /// Record that a run blocks on the given waitpoints.
    async fn block_run_with_waitpoints(
        &self,
        run_id: RunId,
        waitpoint_ids: &[WaitpointId],
    ) -> BackendResult<BlockingState>;

    async fn blocking_state(&self, run_id: RunId) -> BackendResult<BlockingState>;

    /// Drop the run's blocking rows once the run has consumed the completions.
    async fn clear_blocking_waitpoints(&self, run_id: RunId) -> BackendResult<()>;
}
