// Write payloads for the relational store. They carry only what the engine
// decides; ids and timestamps are assigned by the backend.

use serde::{Deserialize, Serialize};

use conveyor_run_core::{
    CheckpointId, CheckpointInput, ExecutionStatus, RunId, RunStatus, SnapshotId,
    SnapshotMetadata, TaskRun, WaitpointId,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
/// New snapshot to append to a run's chain.
pub struct CreateSnapshotRecord {
    pub run_id: RunId,
    /// Must equal the run's current latest snapshot id or the write fails with a conflict.
    pub expected_previous: Option<SnapshotId>,
    pub execution_status: ExecutionStatus,
    pub run_status: RunStatus,
    pub description: String,
    pub attempt_number: Option<u32>,
    pub completed_waitpoints: Vec<WaitpointId>,
    pub checkpoint_id: Option<CheckpointId>,
    pub worker_id: Option<String>,
    pub runner_id: Option<String>,
    pub metadata: SnapshotMetadata,
}

#[derive(Clone, Debug)]
/// Transactional update of a run's coarse status.
pub struct RunStatusUpdate {
    pub run_id: RunId,
    pub status: RunStatus,
    /// `Some` replaces the attempt number, `None` leaves it unchanged.
    pub attempt_number: Option<u32>,
}

#[derive(Clone, Debug)]
/// Checkpoint to persist for a run.
pub struct CreateCheckpointRecord {
    pub run: TaskRun,
    pub input: CheckpointInput,
}

#[derive(Clone, Debug)]
/// Output reported when a waitpoint resolves.
pub struct CompleteWaitpointRecord {
    pub waitpoint_id: WaitpointId,
    pub output: Option<serde_json::Value>,
    pub output_is_error: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Blocking state of a run after a waitpoint resolved.
pub struct BlockingState {
    pub run_id: RunId,
    pub pending: Vec<WaitpointId>,
    pub completed: Vec<WaitpointId>,
}

impl BlockingState {
    pub fn is_unblocked(&self) -> bool {
        self.pending.is_empty()
    }
}

