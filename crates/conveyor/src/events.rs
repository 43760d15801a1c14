//! Outbound engine events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use conveyor_run_core::{
    CheckpointId, CheckpointInput, ExecutionStatus, ReleaseConcurrencyScope, RunId, RunStatus,
    SnapshotId,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStatusChanged {
        run_id: RunId,
        status: RunStatus,
        time: DateTime<Utc>,
    },
    ExecutionSnapshotCreated {
        run_id: RunId,
        snapshot_id: SnapshotId,
        execution_status: ExecutionStatus,
        description: String,
    },
    CheckpointDiscarded {
        run_id: RunId,
        snapshot_id: SnapshotId,
        checkpoint: CheckpointInput,
        reason: String,
    },
    RunSuspended {
        run_id: RunId,
        snapshot_id: SnapshotId,
        checkpoint_id: CheckpointId,
    },
    /// Tells the run's runner process to fetch its latest snapshot.
    WorkerNotification {
        run_id: RunId,
        snapshot_id: SnapshotId,
        execution_status: ExecutionStatus,
    },
    RunDeadLettered {
        run_id: RunId,
        attempt: u32,
    },
    ConcurrencyReleased {
        run_id: RunId,
        snapshot_id: SnapshotId,
        scope: ReleaseConcurrencyScope,
    },
}

/// Fire-and-forget event channel. Emitting never blocks and succeeds with no
/// subscribers; slow subscribers observe `Lagged` instead of stalling the engine.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
