//! Execution snapshots: the immutable records forming each run's state chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    CheckpointId, EnvironmentType, ExecutionStatus, ReleaseConcurrencyScope, RunId, RunStatus,
    SnapshotId, TenantDescriptor, WaitpointId,
};

/// Extra data attached to a snapshot at creation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Resolved once when the run blocks so deferred releases never re-derive it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_concurrency: Option<ReleaseConcurrencyScope>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub id: SnapshotId,
    pub run_id: RunId,
    pub execution_status: ExecutionStatus,
    pub run_status: RunStatus,
    pub description: String,
    pub attempt_number: Option<u32>,
    pub previous_snapshot_id: Option<SnapshotId>,
    pub completed_waitpoints: Vec<WaitpointId>,
    pub checkpoint_id: Option<CheckpointId>,
    pub worker_id: Option<String>,
    pub runner_id: Option<String>,
    pub organization_id: String,
    pub project_id: String,
    pub environment_id: String,
    pub environment_type: EnvironmentType,
    #[serde(default)]
    pub metadata: SnapshotMetadata,
    pub created_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
    pub fn tenant(&self) -> TenantDescriptor {
        TenantDescriptor {
            organization_id: self.organization_id.clone(),
            project_id: self.project_id.clone(),
            environment_id: self.environment_id.clone(),
        }
    }
}

/// Compact view returned to callers of the engine entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub id: SnapshotId,
    pub execution_status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
}

impl From<&ExecutionSnapshot> for SnapshotSummary {
    fn from(snapshot: &ExecutionSnapshot) -> Self {
        Self {
            id: snapshot.id,
            execution_status: snapshot.execution_status,
            created_at: snapshot.created_at,
        }
    }
}
