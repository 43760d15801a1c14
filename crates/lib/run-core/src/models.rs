//! Records owned by the relational store plus the derived tenant descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    CheckpointId, CheckpointType, EnvironmentType, QueueId, RunId, RunStatus, WaitpointId,
    WaitpointStatus,
};

/// A unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: RunId,
    pub status: RunStatus,
    pub attempt_number: Option<u32>,
    pub task_identifier: String,
    pub queue: String,
    pub concurrency_key: Option<String>,
    pub worker_queue: String,
    pub machine_preset: Option<String>,
    pub organization_id: String,
    pub project_id: String,
    pub environment_id: String,
    pub environment_type: EnvironmentType,
    pub locked_queue_id: Option<QueueId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRun {
    pub fn tenant(&self) -> TenantDescriptor {
        TenantDescriptor {
            organization_id: self.organization_id.clone(),
            project_id: self.project_id.clone(),
            environment_id: self.environment_id.clone(),
        }
    }

    pub fn queue_descriptor(&self) -> QueueDescriptor {
        QueueDescriptor {
            organization_id: self.organization_id.clone(),
            project_id: self.project_id.clone(),
            environment_id: self.environment_id.clone(),
            queue: self.queue.clone(),
            concurrency_key: self.concurrency_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEnvironment {
    pub id: String,
    pub organization_id: String,
    pub project_id: String,
    pub environment_type: EnvironmentType,
    pub maximum_concurrency_limit: u32,
}

impl RuntimeEnvironment {
    pub fn tenant(&self) -> TenantDescriptor {
        TenantDescriptor {
            organization_id: self.organization_id.clone(),
            project_id: self.project_id.clone(),
            environment_id: self.id.clone(),
        }
    }
}

/// Queue configuration a run can be locked to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQueue {
    pub id: QueueId,
    pub name: String,
    pub environment_id: String,
    /// `None` means the queue is only bounded by the environment limit.
    pub concurrency_limit: Option<u32>,
    pub release_concurrency_on_waitpoint: bool,
}

/// Reference to an externally stored CPU/memory image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunCheckpoint {
    pub id: CheckpointId,
    pub run_id: RunId,
    pub checkpoint_type: CheckpointType,
    pub location: String,
    pub image_ref: String,
    pub reason: Option<String>,
    pub organization_id: String,
    pub project_id: String,
    pub environment_id: String,
    pub created_at: DateTime<Utc>,
}

/// Checkpoint details reported by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInput {
    pub checkpoint_type: CheckpointType,
    pub location: String,
    pub image_ref: String,
    pub reason: Option<String>,
}

/// A synchronization point runs can block on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waitpoint {
    pub id: WaitpointId,
    pub status: WaitpointStatus,
    pub output: Option<serde_json::Value>,
    pub output_is_error: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub organization_id: String,
    pub project_id: String,
    pub environment_id: String,
    pub created_at: DateTime<Utc>,
}

/// Organization/project/environment scope used for fairness and concurrency accounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantDescriptor {
    pub organization_id: String,
    pub project_id: String,
    pub environment_id: String,
}

impl TenantDescriptor {
    /// Tenants are scheduled per environment.
    pub fn tenant_id(&self) -> &str {
        &self.environment_id
    }
}

/// Addressing unit for queue membership and concurrency counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub organization_id: String,
    pub project_id: String,
    pub environment_id: String,
    pub queue: String,
    pub concurrency_key: Option<String>,
}

impl QueueDescriptor {
    pub fn tenant(&self) -> TenantDescriptor {
        TenantDescriptor {
            organization_id: self.organization_id.clone(),
            project_id: self.project_id.clone(),
            environment_id: self.environment_id.clone(),
        }
    }

    /// Same queue without the concurrency key; limits are configured per base queue.
    pub fn without_concurrency_key(&self) -> Self {
        Self {
            concurrency_key: None,
            ..self.clone()
        }
    }
}
